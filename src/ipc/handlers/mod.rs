pub mod bulletins;
pub mod classes;
pub mod core;
pub mod gradebook;
