pub mod core;
pub mod gradebook;
pub mod imports;
pub mod roster;
pub mod setup;
