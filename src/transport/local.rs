//! Local-file transport

use std::path::Path;

use serde_json::Value;

use crate::error::SluiceError;
use crate::spec::{Binding, Port, Target};
use crate::transport::{effective_target, value_bytes, Transport};

/// `local` mode: bindings reference files on this worker's filesystem.
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn mode(&self) -> &'static str {
        "local"
    }

    fn fetch(&self, binding: &Binding, port: &Port, _dir: &Path) -> Result<Value, SluiceError> {
        let path = binding
            .path
            .as_deref()
            .ok_or_else(|| SluiceError::Transport("local binding has no path".into()))?;
        match effective_target(binding, port) {
            // The file is already where a filepath consumer wants it.
            Target::Filepath => Ok(Value::String(path.to_string())),
            Target::Memory => Ok(Value::String(std::fs::read_to_string(path)?)),
        }
    }

    fn push(&self, data: &Value, binding: &mut Binding, _port: &Port) -> Result<(), SluiceError> {
        let path = binding
            .path
            .as_deref()
            .ok_or_else(|| SluiceError::Transport("local binding has no path".into()))?;
        std::fs::write(path, value_bytes(data)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        let port = Port::new("x", "string", "text");

        let mut out = Binding {
            path: Some(file.display().to_string()),
            ..Default::default()
        };
        LocalTransport
            .push(&json!("written by push"), &mut out, &port)
            .unwrap();

        let fetched = LocalTransport.fetch(&out, &port, dir.path()).unwrap();
        assert_eq!(fetched, json!("written by push"));
    }

    #[test]
    fn filepath_target_passes_path_through() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("big.bin");
        std::fs::write(&file, b"not read").unwrap();

        let mut port = Port::new("x", "string", "text");
        port.target = Target::Filepath;
        let binding = Binding {
            path: Some(file.display().to_string()),
            ..Default::default()
        };

        let fetched = LocalTransport.fetch(&binding, &port, dir.path()).unwrap();
        assert_eq!(fetched, Value::String(file.display().to_string()));
    }

    #[test]
    fn missing_path_is_transport_error() {
        let port = Port::new("x", "string", "text");
        let err = LocalTransport
            .fetch(&Binding::default(), &port, Path::new("/tmp"))
            .unwrap_err();
        assert!(matches!(err, SluiceError::Transport(_)));
    }
}
