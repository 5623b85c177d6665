//! Device providers: where devices come from.
//!
//! A [`DeviceProvider`] announces devices as they appear and disappear.
//! The scheduler subscribes once and routes each event to the pool the
//! device belongs to.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │        DeviceProvider        │
//! │                              │
//! │  subscribe() ──► DeviceEventStream
//! │  terminate()                 │
//! └───────────────┬──────────────┘
//!                 │ Connected(Box<dyn Device>) / Disconnected(DeviceInfo)
//!                 ▼
//!            Scheduler ──► DevicePoolActor (per pool)
//! ```
//!
//! The end of the stream means no further devices will connect; pools
//! that have none left then start their grace timer.
//!
//! # Built-in Providers
//!
//! | Provider | Module | Description |
//! |----------|--------|-------------|
//! | Local | [`local`] | Virtual devices that run a shell command per batch |
//! | Channel | [`channel`] | Devices pushed in by the embedding program |
//!
//! # Error Handling
//!
//! All provider operations return [`ProviderResult<T>`], which wraps
//! [`ProviderError`]. Errors raised before the stream is handed out are
//! fatal for the run; anything after that surfaces as device events.

pub mod channel;
pub mod local;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::config::DevicesConfig;
use crate::model::{Device, DeviceInfo};

pub use channel::ChannelDeviceProvider;
pub use local::{LocalDevice, LocalDeviceProvider};

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur during provider operations.
///
/// # Example
///
/// ```no_run
/// use fleetrun::provider::{ProviderError, ProviderResult};
///
/// fn handle_error(result: ProviderResult<()>) {
///     match result {
///         Ok(()) => println!("Success"),
///         Err(ProviderError::Connection(msg)) => println!("Connection failed: {}", msg),
///         Err(e) => println!("Error: {}", e),
///     }
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider could not start.
    #[error("Failed to initialize device provider: {0}")]
    InitFailed(String),

    /// Failed to reach the device backend.
    #[error("Connection error: {0}")]
    Connection(String),

    /// `subscribe` was called twice.
    #[error("Device provider was already subscribed")]
    AlreadySubscribed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Provider-specific error not covered by other variants.
    #[error("Provider-specific error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A change in the set of available devices.
pub enum DeviceProviderEvent {
    Connected(Box<dyn Device>),
    Disconnected(DeviceInfo),
}

impl fmt::Debug for DeviceProviderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProviderEvent::Connected(device) => {
                write!(f, "Connected({})", device.serial_number())
            }
            DeviceProviderEvent::Disconnected(info) => {
                write!(f, "Disconnected({})", info.serial_number)
            }
        }
    }
}

/// Stream of device events returned by [`DeviceProvider::subscribe`].
pub type DeviceEventStream = Pin<Box<dyn Stream<Item = DeviceProviderEvent> + Send>>;

/// Source of devices for a run.
///
/// # Implementing a provider
///
/// ```no_run
/// use async_trait::async_trait;
/// use futures::stream;
/// use fleetrun::provider::*;
///
/// struct Lab;
///
/// #[async_trait]
/// impl DeviceProvider for Lab {
///     async fn subscribe(&mut self) -> ProviderResult<DeviceEventStream> {
///         Ok(Box::pin(stream::empty()))
///     }
///     async fn terminate(&mut self) {}
/// }
/// ```
#[async_trait]
pub trait DeviceProvider: Send {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "device-provider"
    }

    /// Starts the provider and returns its event stream.
    ///
    /// May only be called once.
    async fn subscribe(&mut self) -> ProviderResult<DeviceEventStream>;

    /// Stops announcing devices and releases provider resources.
    ///
    /// Devices already handed out are disposed by their workers, not here.
    async fn terminate(&mut self);
}

/// Builds the provider selected in the configuration.
pub fn from_config(config: &DevicesConfig, output_timeout: std::time::Duration) -> Box<dyn DeviceProvider> {
    match config {
        DevicesConfig::Local(local) => Box::new(LocalDeviceProvider::new(local.clone(), output_timeout)),
    }
}

/// A process invocation built from a command template.
///
/// # Example
///
/// ```
/// use fleetrun::provider::Command;
///
/// let cmd = Command::from_template("./run.sh --suite {tests}", &["a.B#c", "a.B#d"]).unwrap();
/// assert_eq!(cmd.program, "./run.sh");
/// assert_eq!(cmd.args, vec!["--suite", "a.B#c", "a.B#d"]);
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory for command execution.
    pub working_dir: Option<String>,

    /// Environment variables to set for this command.
    pub env: Vec<(String, String)>,
}

/// Placeholder replaced by the test ids of a batch.
pub const TESTS_PLACEHOLDER: &str = "{tests}";

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Splits `template` with shell quoting rules and substitutes
    /// [`TESTS_PLACEHOLDER`].
    ///
    /// A word that is exactly `{tests}` expands into one argument per test;
    /// a placeholder embedded in a longer word is replaced by the
    /// space-separated ids.
    pub fn from_template<S: AsRef<str>>(template: &str, tests: &[S]) -> ProviderResult<Self> {
        let words = shell_words::split(template)
            .map_err(|e| ProviderError::InitFailed(format!("Invalid command '{}': {}", template, e)))?;

        let mut expanded = Vec::with_capacity(words.len() + tests.len());
        for word in words {
            if word == TESTS_PLACEHOLDER {
                expanded.extend(tests.iter().map(|t| t.as_ref().to_string()));
            } else if word.contains(TESTS_PLACEHOLDER) {
                let joined = tests.iter().map(|t| t.as_ref()).collect::<Vec<&str>>().join(" ");
                expanded.push(word.replace(TESTS_PLACEHOLDER, &joined));
            } else {
                expanded.push(word);
            }
        }

        let mut words = expanded.into_iter();
        let program = words
            .next()
            .ok_or_else(|| ProviderError::InitFailed("Command is empty".to_string()))?;
        Ok(Self::new(program).args(words))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for this command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Converts the command to a shell-executable string, for logs.
    ///
    /// ```
    /// use fleetrun::provider::Command;
    /// let cmd = Command::new("echo").arg("hello world");
    /// assert_eq!(cmd.to_shell_string(), "echo 'hello world'");
    /// ```
    pub fn to_shell_string(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| shell_words::quote(s).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_expands_standalone_placeholder() {
        let cmd = Command::from_template("runner --verbose {tests}", &["a.B#c", "a.B#d"]).unwrap();
        assert_eq!(cmd.program, "runner");
        assert_eq!(cmd.args, vec!["--verbose", "a.B#c", "a.B#d"]);
    }

    #[test]
    fn test_template_embedded_placeholder_is_joined() {
        let cmd = Command::from_template("runner '--filter={tests}'", &["a.B#c", "a.B#d"]).unwrap();
        assert_eq!(cmd.args, vec!["--filter=a.B#c a.B#d"]);
    }

    #[test]
    fn test_template_without_placeholder() {
        let cmd = Command::from_template("sh -c 'echo hi'", &["a.B#c"]).unwrap();
        assert_eq!(cmd.program, "sh");
        assert_eq!(cmd.args, vec!["-c", "echo hi"]);
    }

    #[test]
    fn test_template_errors() {
        assert!(Command::from_template("", &["a.B#c"]).is_err());
        assert!(Command::from_template("runner 'unterminated", &["a.B#c"]).is_err());
    }

    #[test]
    fn test_shell_string_quotes_arguments() {
        let cmd = Command::new("runner").arg("--verbose").arg("two words");
        assert_eq!(cmd.to_shell_string(), "runner --verbose 'two words'");
    }
}
