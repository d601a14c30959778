//! Entity types shared by the repositories, scheduler, and gateway.

mod active_agent;
mod assignment;
mod connected_channel;
mod integration;
mod job;
mod org;
mod processed_message;
mod setting;
mod user;

pub use active_agent::ActiveAgent;
pub use assignment::AgentJobAssignment;
pub use connected_channel::ConnectedChannel;
pub use integration::{ChatPlatformKind, Integration};
pub use job::Job;
pub use org::Organization;
pub use processed_message::{MessageStatus, ProcessedMessage};
pub use setting::SettingValue;
pub use user::User;
