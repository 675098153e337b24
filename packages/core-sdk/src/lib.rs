pub mod buddy;
pub mod config;
pub mod db;
pub mod llm;
pub mod models;
pub mod ports;
pub mod render;
pub mod server;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::buddy::{
        self, AskError, Buddy, ExchangeReport, ExchangeState, KeyCapture, KeyFieldState, KeyOutcome,
    };
    pub use crate::config::BuddyConfig;
    pub use crate::db;
    pub use crate::llm;
    pub use crate::models::{self, ChatMessage, Identity, Notice, Role};
    pub use crate::ports::{self, Notifier};
    pub use crate::server;
    pub use crate::telemetry;
}
