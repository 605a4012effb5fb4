use bytes::Bytes;

/// Requests understood by beanstalkd
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `put <pri> <delay> <ttr> <bytes>` followed by the body
    Put {
        priority: u32,
        delay: u64,
        ttr: u64,
        body: Bytes,
    },
    Use(String),
    Watch(String),
    Ignore(String),
    Reserve,
    ReserveWithTimeout(u64),
    Delete(u64),
    Release {
        id: u64,
        priority: u32,
        delay: u64,
    },
    Stats,
    StatsTube(String),
    Quit,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Put { .. } => "put",
            Command::Use(_) => "use",
            Command::Watch(_) => "watch",
            Command::Ignore(_) => "ignore",
            Command::Reserve => "reserve",
            Command::ReserveWithTimeout(_) => "reserve-with-timeout",
            Command::Delete(_) => "delete",
            Command::Release { .. } => "release",
            Command::Stats => "stats",
            Command::StatsTube(_) => "stats-tube",
            Command::Quit => "quit",
        }
    }

    /// Command line without the trailing CRLF
    pub fn header(&self) -> String {
        match self {
            Command::Put {
                priority,
                delay,
                ttr,
                body,
            } => format!("put {} {} {} {}", priority, delay, ttr, body.len()),
            Command::Use(tube) => format!("use {}", tube),
            Command::Watch(tube) => format!("watch {}", tube),
            Command::Ignore(tube) => format!("ignore {}", tube),
            Command::Reserve => "reserve".to_string(),
            Command::ReserveWithTimeout(seconds) => format!("reserve-with-timeout {}", seconds),
            Command::Delete(id) => format!("delete {}", id),
            Command::Release {
                id,
                priority,
                delay,
            } => format!("release {} {} {}", id, priority, delay),
            Command::Stats => "stats".to_string(),
            Command::StatsTube(tube) => format!("stats-tube {}", tube),
            Command::Quit => "quit".to_string(),
        }
    }
}

/// Replies sent by beanstalkd
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Inserted(u64),
    /// `BURIED` carries an id only as a reply to `put`
    Buried(Option<u64>),
    Using(String),
    Watching(u32),
    Reserved { id: u64, body: Bytes },
    TimedOut,
    DeadlineSoon,
    Deleted,
    Released,
    Ok(Bytes),
    NotFound,
    NotIgnored,
    /// OUT_OF_MEMORY, INTERNAL_ERROR, BAD_FORMAT, UNKNOWN_COMMAND,
    /// EXPECTED_CRLF, JOB_TOO_BIG, DRAINING
    Error(String),
}

impl Response {
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_header() {
        let put = Command::Put {
            priority: 1024,
            delay: 0,
            ttr: 60,
            body: Bytes::from_static(b"hello"),
        };
        assert_eq!(put.header(), "put 1024 0 60 5");
        assert_eq!(put.name(), "put");

        assert_eq!(Command::ReserveWithTimeout(5).header(), "reserve-with-timeout 5");
        assert_eq!(
            Command::Release {
                id: 3,
                priority: 10,
                delay: 2
            }
            .header(),
            "release 3 10 2"
        );
        assert_eq!(Command::StatsTube("process".into()).header(), "stats-tube process");
    }
}
