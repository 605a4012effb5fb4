use crate::{CoreError, PublishOptions, Result, MAX_PAYLOAD_SIZE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Job payload carried through the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Launch an OS process
    Process(ProcessMessage),
    /// Forward a nested message through a named publisher
    Serialized(SerializedMessage),
}

impl Message {
    /// Variant name, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Process(_) => "process",
            Message::Serialized(_) => "serialized",
        }
    }

    /// Serialize message to a job body
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(CoreError::PayloadTooLarge {
                max: MAX_PAYLOAD_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Deserialize message from a job body
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(CoreError::from)
    }
}

impl From<ProcessMessage> for Message {
    fn from(message: ProcessMessage) -> Self {
        Message::Process(message)
    }
}

impl From<SerializedMessage> for Message {
    fn from(message: SerializedMessage) -> Self {
        Message::Serialized(message)
    }
}

/// Command to execute, either through `sh -c` or as an argument vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Commandline {
    Shell(String),
    Argv(Vec<String>),
}

impl fmt::Display for Commandline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Commandline::Shell(line) => f.write_str(line),
            Commandline::Argv(args) => f.write_str(&args.join(" ")),
        }
    }
}

/// Command execution job descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMessage {
    pub commandline: Commandline,

    /// Working directory, inherited when unset
    pub cwd: Option<PathBuf>,

    /// Extra environment variables, merged over the worker's environment
    pub env: Option<HashMap<String, String>>,

    /// Bytes written to the child's stdin
    pub input: Option<Vec<u8>>,

    /// Seconds the process may run; `None` uses the worker default, `Some(0)` disables
    pub timeout: Option<u64>,

    /// Never launch after this instant
    pub deadline: Option<DateTime<Utc>>,

    /// Do not launch before this instant
    pub ready_at: Option<DateTime<Utc>>,

    /// Consider the job done without running it from this instant on
    pub expires_at: Option<DateTime<Utc>>,
}

impl ProcessMessage {
    /// Command run through `sh -c`
    pub fn shell(commandline: impl Into<String>) -> Self {
        Self::with_commandline(Commandline::Shell(commandline.into()))
    }

    /// Command run without a shell
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_commandline(Commandline::Argv(args.into_iter().map(Into::into).collect()))
    }

    fn with_commandline(commandline: Commandline) -> Self {
        ProcessMessage {
            commandline,
            cwd: None,
            env: None,
            input: None,
            timeout: None,
            deadline: None,
            ready_at: None,
            expires_at: None,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn ready_at(mut self, ready_at: DateTime<Utc>) -> Self {
        self.ready_at = Some(ready_at);
        self
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Deadline strictly before `now`
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| deadline < now)
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.ready_at.map_or(true, |ready_at| ready_at <= now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Envelope asking a worker to publish `message` through `publisher`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedMessage {
    /// Name of a publisher in the worker's registry
    pub publisher: Option<String>,
    pub message: Option<Box<Message>>,
    pub options: PublishOptions,
}

impl SerializedMessage {
    pub fn new(publisher: impl Into<String>, message: impl Into<Message>) -> Self {
        SerializedMessage {
            publisher: Some(publisher.into()),
            message: Some(Box::new(message.into())),
            options: PublishOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PublishOptions) -> Self {
        self.options = options;
        self
    }

    pub fn publisher(&self) -> Option<&str> {
        self.publisher.as_deref()
    }

    pub fn message(&self) -> Option<&Message> {
        self.message.as_deref()
    }

    pub fn options(&self) -> &PublishOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_process_message_bytes() {
        let message: Message = ProcessMessage::shell("echo hi")
            .cwd("/tmp")
            .env("LANG", "C")
            .timeout(5)
            .into();

        let bytes = message.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, message);
        assert_eq!(decoded.kind(), "process");
    }

    #[test]
    fn test_nested_serialized_message() {
        let inner = ProcessMessage::argv(["ls", "-la"]);
        let envelope = SerializedMessage::new("mail", inner.clone())
            .with_options(PublishOptions::new().priority(5u32));
        let message = Message::Serialized(envelope);

        let decoded = Message::from_bytes(&message.to_bytes().unwrap()).unwrap();
        match decoded {
            Message::Serialized(envelope) => {
                assert_eq!(envelope.publisher(), Some("mail"));
                assert_eq!(envelope.message(), Some(&Message::Process(inner)));
                assert_eq!(envelope.options().priority.value(), 5);
            }
            other => panic!("unexpected variant {}", other.kind()),
        }
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(Message::from_bytes(b"").is_err());
        assert!(Message::from_bytes(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_payload_size_limit() {
        let message: Message = ProcessMessage::shell("cat")
            .input(vec![0u8; MAX_PAYLOAD_SIZE + 1])
            .into();

        match message.to_bytes() {
            Err(CoreError::PayloadTooLarge { .. }) => {}
            other => panic!("Expected PayloadTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_lifecycle_checks() {
        let now = Utc::now();
        let message = ProcessMessage::shell("true")
            .deadline(now - Duration::seconds(1))
            .ready_at(now + Duration::seconds(60))
            .expires_at(now);

        assert!(message.is_past_deadline(now));
        assert!(!message.is_ready(now));
        assert!(message.is_ready(now + Duration::seconds(61)));
        assert!(message.is_expired(now));

        let plain = ProcessMessage::shell("true");
        assert!(!plain.is_past_deadline(now));
        assert!(plain.is_ready(now));
        assert!(!plain.is_expired(now));
    }

    #[test]
    fn test_deadline_equal_to_now_is_not_past() {
        let now = Utc::now();
        let message = ProcessMessage::shell("true").deadline(now);
        assert!(!message.is_past_deadline(now));
    }

    #[test]
    fn test_commandline_display() {
        assert_eq!(Commandline::Shell("sleep 1".into()).to_string(), "sleep 1");
        assert_eq!(
            ProcessMessage::argv(["echo", "a", "b"]).commandline.to_string(),
            "echo a b"
        );
    }
}
