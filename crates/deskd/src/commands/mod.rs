//! Whitelisted remote command execution.

mod args;
mod dispatcher;
mod platform;
mod request;
mod whitelist;

pub use args::ArgError;
pub use args::ArgSchema;
pub use args::ArgSpec;
pub use args::ArgType;
pub use dispatcher::CommandDispatcher;
pub use dispatcher::DispatchError;
pub use dispatcher::Invocation;
pub use dispatcher::Launcher;
pub use dispatcher::Outcome;
pub use dispatcher::SystemLauncher;
pub use platform::Platform;
pub use request::CommandRequest;
pub use request::CommandResult;
pub use request::Origin;
pub use request::ResultStatus;
pub use request::RunRequest;
pub use whitelist::CommandDefinition;
pub use whitelist::Token;
pub use whitelist::Whitelist;
pub use whitelist::WhitelistError;
