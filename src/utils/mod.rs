pub mod fs;
pub mod observability;
pub mod time;
