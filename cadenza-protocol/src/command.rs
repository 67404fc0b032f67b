//! Commands sent from the agent to the worker over its stdin.

use crate::error::ProtocolError;
use crate::wire::{self, Cursor};

pub const TAG_BUILD: u8 = 0x01;

/// Where the worker should ship its structured build log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub token: String,
    pub path: String,
    pub host: String,
}

/// A command frame. The build core sends exactly one `Build` per worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Build {
        drv_path: String,
        input_paths: Vec<String>,
        log_settings: LogSettings,
    },
}

impl Command {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Command::Build {
                drv_path,
                input_paths,
                log_settings,
            } => {
                wire::put_u8(&mut buf, TAG_BUILD);
                wire::put_string(&mut buf, drv_path);
                wire::put_string_list(&mut buf, input_paths);
                wire::put_string(&mut buf, &log_settings.token);
                wire::put_string(&mut buf, &log_settings.path);
                wire::put_string(&mut buf, &log_settings.host);
            }
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut cur = Cursor::new(payload);
        let command = match cur.get_u8("command tag")? {
            TAG_BUILD => Command::Build {
                drv_path: cur.get_string("drv path")?,
                input_paths: cur.get_string_list("input paths")?,
                log_settings: LogSettings {
                    token: cur.get_string("log token")?,
                    path: cur.get_string("log path")?,
                    host: cur.get_string("log host")?,
                },
            },
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        cur.finish()?;
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_roundtrip() {
        let command = Command::Build {
            drv_path: "/nix/store/aaa-hello.drv".into(),
            input_paths: vec!["/nix/store/bbb-stdenv".into(), "/nix/store/ccc-bash".into()],
            log_settings: LogSettings {
                token: "secret".into(),
                path: "/api/v1/logs/build".into(),
                host: "logs.example.com".into(),
            },
        };
        assert_eq!(Command::decode(&command.encode()).unwrap(), command);
    }

    #[test]
    fn test_unknown_command_tag() {
        assert!(matches!(
            Command::decode(&[0x55]).unwrap_err(),
            ProtocolError::UnknownTag(0x55)
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let command = Command::Build {
            drv_path: "/nix/store/aaa-hello.drv".into(),
            input_paths: vec![],
            log_settings: LogSettings {
                token: String::new(),
                path: String::new(),
                host: String::new(),
            },
        };
        let mut payload = command.encode();
        payload.push(0);
        assert!(matches!(
            Command::decode(&payload).unwrap_err(),
            ProtocolError::TrailingBytes(1)
        ));
    }
}
