use std::{fmt, io};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Line a client sends to end its session. Matched without regard to case.
pub const EXIT_COMMAND: &str = "exit";

/// Line written to a connection refused by admission control.
pub const SERVER_FULL: &str = "server is full";

/// Text the relay fans out to the other members of the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice<'a> {
    Joined { name: &'a str },
    Left { name: &'a str },
    Chat { name: &'a str, text: &'a str },
}

impl fmt::Display for Notice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Joined { name } => write!(f, "{name} joined the chat"),
            Notice::Left { name } => write!(f, "{name} left the chat"),
            Notice::Chat { name, text } => write!(f, "{name}: {text}"),
        }
    }
}

pub fn is_exit_command(line: &str) -> bool {
    line.eq_ignore_ascii_case(EXIT_COMMAND)
}

/// Reads one line, stripping the terminator. `None` means the peer closed the stream.
///
/// Blank lines are returned as empty strings; every line the client sends counts.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }

    let trimmed = line.trim_end_matches(LINE_ENDINGS).len();
    line.truncate(trimmed);
    Ok(Some(line))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    // Single buffer so a line is never split across two writes.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
