pub mod controls;
pub mod device;
pub mod firmware;
pub mod registry;
pub mod selection;
