pub mod collaborators;
pub mod glowworm;
pub mod mqtt;
pub mod protocols;
pub mod settings;
pub mod tasks;
