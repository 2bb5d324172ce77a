pub use self::parser::{
    BridgeConfig, BridgeMode, Config, DatabaseConfig, DbType, LoggingConfig, MattermostConfig,
    MirrorConfig, PortalWaitConfig, ReconnectConfig, RegistrationConfig, SynapseAdminConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
