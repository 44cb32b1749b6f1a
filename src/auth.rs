//! Challenge/response authentication against the DVR.
//!
//! Login is three steps on a freshly opened command socket, issued inline
//! before any background task starts: fetch the `LoginFlag` nonce, run it
//! through the credential hash oracle, submit `UserLogin`.
//!
//! The hash function itself is undocumented firmware behavior. It is
//! modelled as the [`HashOracle`] trait; the shipped implementation defers
//! to an external helper program so deployments can plug in whatever the
//! firmware actually ships.

use std::io::Write;
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::Command;

use crate::constants::COMMAND_READ_TIMEOUT;
use crate::error::{SessionError, SessionResult};
use crate::protocol::{
    frame_command, make_command_body, parse_body, read_message, xml_attr, ID_LOGIN_GET_FLAG,
    ID_USER_LOGIN,
};

/// Environment variable naming the credential hash helper program.
pub const HASH_HELPER_ENV: &str = "DVR_HASH_HELPER";

/// Computes the device's credential hash from the login nonce.
pub trait HashOracle: Send + Sync {
    /// Returns the hash the firmware expects in `UserLogin LoginFlag="…"`.
    ///
    /// An empty or unavailable hash is an authentication error; callers
    /// must not fall back to sending the raw password.
    fn credential_hash(&self, nonce: &str, username: &str, password: &str)
        -> SessionResult<String>;
}

/// Hash oracle backed by an external helper program.
///
/// The helper is invoked as `helper <nonce> <username> <password>` and its
/// trimmed stdout is the hash.
#[derive(Debug, Clone)]
pub struct HelperHashOracle {
    program: PathBuf,
}

impl HelperHashOracle {
    /// Oracle using an explicit helper path.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    /// Oracle from the `DVR_HASH_HELPER` environment variable.
    pub fn from_env() -> SessionResult<Self> {
        let program = std::env::var(HASH_HELPER_ENV).map_err(|_| {
            SessionError::Auth(format!("{HASH_HELPER_ENV} is not set; cannot compute login hash"))
        })?;
        Ok(Self::new(program))
    }
}

impl HashOracle for HelperHashOracle {
    fn credential_hash(
        &self,
        nonce: &str,
        username: &str,
        password: &str,
    ) -> SessionResult<String> {
        let output = Command::new(&self.program)
            .arg(nonce)
            .arg(username)
            .arg(password)
            .output()
            .map_err(|e| {
                SessionError::Auth(format!("hash helper {:?} failed to run: {e}", self.program))
            })?;
        if !output.status.success() {
            return Err(SessionError::Auth(format!(
                "hash helper {:?} exited with {}",
                self.program, output.status
            )));
        }
        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if hash.is_empty() {
            return Err(SessionError::Auth("hash helper produced no output".into()));
        }
        Ok(hash)
    }
}

/// Fetch the login nonce with `LoginGetFlag`.
///
/// `inner` is the request fragment; the streaming session names the user,
/// the config session sends the bare element.
pub(crate) fn fetch_login_flag(stream: &mut TcpStream, inner: &str) -> SessionResult<String> {
    send_inline(stream, ID_LOGIN_GET_FLAG, inner)?;
    let reply = read_reply(stream, "LoginGetFlag")?;
    xml_attr(&reply, "LoginFlag")
        .ok_or_else(|| SessionError::Protocol(format!("no LoginFlag in reply: {}", excerpt(&reply))))
}

/// Submit `UserLogin` and verify the device accepted it.
pub(crate) fn submit_login(stream: &mut TcpStream, inner: &str) -> SessionResult<()> {
    send_inline(stream, ID_USER_LOGIN, inner)?;
    let reply = read_reply(stream, "UserLogin")?;
    if !reply.contains(r#"CmdReply="0""#) {
        return Err(SessionError::Auth(format!("login rejected: {}", excerpt(&reply))));
    }
    Ok(())
}

/// Full login for a streaming session.
pub(crate) fn login(
    stream: &mut TcpStream,
    username: &str,
    password: &str,
    oracle: &dyn HashOracle,
) -> SessionResult<()> {
    let nonce = fetch_login_flag(stream, &format!(r#"<LoginGetFlag UserName="{username}" />"#))?;
    log::debug!("login nonce: {nonce}");

    let hash = oracle.credential_hash(&nonce, username, password)?;

    submit_login(
        stream,
        &format!(
            r#"<UserLogin UserName="{username}" UserIP="192.168.1.1" UserMAC="00:00:00:00:00:00" LoginFlag="{hash}" />"#
        ),
    )?;
    log::info!("login successful for {username}");
    Ok(())
}

fn send_inline(stream: &mut TcpStream, cmd_id: u32, inner: &str) -> SessionResult<()> {
    let body = make_command_body(cmd_id, inner);
    stream.write_all(&frame_command(&body, None))?;
    Ok(())
}

fn read_reply(stream: &mut TcpStream, step: &str) -> SessionResult<String> {
    let (_, body) = read_message(stream, COMMAND_READ_TIMEOUT)?
        .ok_or_else(|| SessionError::closed(step))?;
    Ok(parse_body(&body))
}

/// First 200 chars of a reply, for error messages.
fn excerpt(reply: &str) -> &str {
    &reply[..reply.len().min(200)]
}


#[cfg(test)]
mod tests {
    use super::testing::FakeOracle;
    use super::*;

    #[test]
    fn test_fake_oracle_is_deterministic() {
        let oracle = FakeOracle;
        let a = oracle.credential_hash("ABC", "admin", "123456").unwrap();
        let b = oracle.credential_hash("ABC", "admin", "123456").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "ABC:admin");
    }

    #[test]
    fn test_helper_oracle_missing_program_is_auth_error() {
        let oracle = HelperHashOracle::new("/nonexistent/hieasy-hash-helper");
        let err = oracle.credential_hash("N", "admin", "pw").unwrap_err();
        assert!(matches!(err, SessionError::Auth(_)));
    }

    #[test]
    fn test_helper_oracle_empty_output_is_auth_error() {
        // `true` exits 0 with no stdout.
        let oracle = HelperHashOracle::new("/bin/true");
        let err = oracle.credential_hash("N", "admin", "pw").unwrap_err();
        assert!(matches!(err, SessionError::Auth(_)));
    }
}
