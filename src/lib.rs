pub mod agent;
pub mod browser;
pub mod model;

pub use agent::{
    Action, Agent, AgentError, Computer, ComputerError, FixedDelay, FullHistory, HistoryPolicy,
    MouseButton, Point, Role, SettlePolicy, Turn,
};
pub use browser::{Browser, BrowserConfig};
pub use model::{ModelClient, ModelConfig, ModelError, ModelReply, ModelService};
