pub mod command;
pub mod entity;
pub mod intent;
pub mod utterance;
