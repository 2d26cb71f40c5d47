pub mod enums;
pub mod record;
pub mod schema;
pub mod study;
pub mod upload;

pub use enums::*;
pub use record::*;
pub use schema::*;
pub use study::*;
pub use upload::*;
