pub mod bitfield;
pub mod cursor;
pub mod sync_cell;
