//! `scp -t` sink protocol
//!
//! The remote side runs `scp -t <path>`; we send one `C` record with the
//! file mode, length and name, then the bytes, and read a status byte after
//! each step. Uploads go to a temporary name and are renamed into place.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum ScpError {
    #[error("scp stream failed")]
    Io(#[from] std::io::Error),

    #[error("remote scp reported: {0}")]
    Remote(String),

    #[error("remote scp closed the stream")]
    UnexpectedEof,
}

/// Quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Temporary upload path next to `final_path`
pub fn temp_path(final_path: &str, nonce: &str) -> String {
    match final_path.rsplit_once('/') {
        Some((dir, name)) => format!("{dir}/.{name}.{nonce}.tmp"),
        None => format!(".{final_path}.{nonce}.tmp"),
    }
}

/// Command that receives one file at `path`
pub fn sink_command(path: &str) -> String {
    format!("scp -t {}", shell_quote(path))
}

/// Command that moves the upload into place
pub fn rename_command(temp: &str, final_path: &str) -> String {
    format!("mv -f {} {}", shell_quote(temp), shell_quote(final_path))
}

async fn read_ack<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(), ScpError> {
    let mut status = [0u8; 1];
    if reader.read(&mut status).await? == 0 {
        return Err(ScpError::UnexpectedEof);
    }
    if status[0] == 0 {
        return Ok(());
    }

    let mut message = Vec::new();
    let mut byte = [0u8; 1];
    while reader.read(&mut byte).await? == 1 && byte[0] != b'\n' {
        message.push(byte[0]);
    }
    Err(ScpError::Remote(
        String::from_utf8_lossy(&message).trim().to_string(),
    ))
}

/// Send `data` as `file_name` with permission bits `mode`.
pub async fn send_file<R, W>(
    reader: &mut R,
    writer: &mut W,
    file_name: &str,
    mode: u32,
    data: &[u8],
) -> Result<(), ScpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    read_ack(reader).await?;

    let header = format!("C{:04o} {} {}\n", mode & 0o7777, data.len(), file_name);
    writer.write_all(header.as_bytes()).await?;
    writer.flush().await?;
    read_ack(reader).await?;

    writer.write_all(data).await?;
    writer.write_all(&[0]).await?;
    writer.flush().await?;
    read_ack(reader).await?;

    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    /// Minimal `scp -t` peer: acks, parses the header, collects the body.
    async fn fake_sink(stream: tokio::io::DuplexStream, fail_header: bool) -> (String, Vec<u8>) {
        let (read, mut write) = tokio::io::split(stream);
        let mut read = BufReader::new(read);
        write.write_all(&[0]).await.unwrap();

        let mut header = String::new();
        read.read_line(&mut header).await.unwrap();
        if fail_header {
            write.write_all(b"\x01scp: /opt/agent: Permission denied\n").await.unwrap();
            return (header, Vec::new());
        }
        write.write_all(&[0]).await.unwrap();

        let len: usize = header.split(' ').nth(1).unwrap().parse().unwrap();
        let mut body = vec![0u8; len + 1];
        read.read_exact(&mut body).await.unwrap();
        assert_eq!(body.pop(), Some(0));
        write.write_all(&[0]).await.unwrap();
        (header, body)
    }

    #[tokio::test]
    async fn uploads_file() {
        let (local, remote) = tokio::io::duplex(1024);
        let sink = tokio::spawn(fake_sink(remote, false));

        let (mut read, mut write) = tokio::io::split(local);
        send_file(&mut read, &mut write, "agent.jar", 0o644, b"PK\x03\x04payload")
            .await
            .unwrap();

        let (header, body) = sink.await.unwrap();
        assert_eq!(header, "C0644 11 agent.jar\n");
        assert_eq!(body, b"PK\x03\x04payload");
    }

    #[tokio::test]
    async fn reports_remote_errors() {
        let (local, remote) = tokio::io::duplex(1024);
        let sink = tokio::spawn(fake_sink(remote, true));

        let (mut read, mut write) = tokio::io::split(local);
        let err = send_file(&mut read, &mut write, "agent.jar", 0o644, b"data")
            .await
            .unwrap_err();
        sink.await.unwrap();
        assert!(matches!(err, ScpError::Remote(msg) if msg.contains("Permission denied")));
    }

    #[tokio::test]
    async fn eof_before_ack() {
        let (local, remote) = tokio::io::duplex(64);
        drop(remote);
        let (mut read, mut write) = tokio::io::split(local);
        let err = send_file(&mut read, &mut write, "f", 0o600, b"").await.unwrap_err();
        assert!(matches!(err, ScpError::UnexpectedEof));
    }

    #[test]
    fn commands_quote_paths() {
        let temp = temp_path("/tmp/ec2 agent/agent.jar", "abc");
        assert_eq!(temp, "/tmp/ec2 agent/.agent.jar.abc.tmp");
        assert_eq!(sink_command(&temp), "scp -t '/tmp/ec2 agent/.agent.jar.abc.tmp'");
        assert_eq!(
            rename_command(&temp, "/tmp/ec2 agent/agent.jar"),
            "mv -f '/tmp/ec2 agent/.agent.jar.abc.tmp' '/tmp/ec2 agent/agent.jar'"
        );
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
