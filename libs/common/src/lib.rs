pub mod attrs;
pub mod id;

pub use attrs::Attrs;
