pub mod config;
pub mod errors;
pub mod resources;
pub mod trial;

pub use config::*;
pub use errors::*;
pub use resources::*;
pub use trial::*;
