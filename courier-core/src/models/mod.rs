pub mod execution;
pub mod message;
pub mod session;
pub mod user;

pub use execution::{ExecutionRecord, ExecutionStatus};
pub use message::{Direction, MessageRecord, MessageStats};
pub use session::{AgentSession, NewSession, SessionStatus};
pub use user::User;
