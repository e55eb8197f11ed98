//! HTTP transport
//!
//! Fetch and push over HTTP(S) with a blocking client. Streamed pushes pump
//! through an OS pipe: the pusher writes into the pipe while a background
//! thread streams the read side out as the request body, so chunked uploads
//! never buffer the whole payload.

use std::io::{Read, Write};
use std::path::Path;
use std::thread::JoinHandle;

use reqwest::blocking::{Body, Client, Response};
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use crate::error::SluiceError;
use crate::spec::{Binding, Port, Target};
use crate::stream::{os_pipe, StreamFetcher, StreamPusher};
use crate::transport::{effective_target, fetch_file_name, value_bytes, Transport};

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    fn request(
        &self,
        binding: &Binding,
        default_method: Method,
    ) -> Result<reqwest::blocking::RequestBuilder, SluiceError> {
        let url = binding
            .url
            .as_deref()
            .ok_or_else(|| SluiceError::Transport("http binding has no url".into()))?;
        let method = match &binding.method {
            Some(name) => Method::from_bytes(name.to_uppercase().as_bytes())
                .map_err(|_| SluiceError::Transport(format!("bad http method '{name}'")))?,
            None => default_method,
        };
        let mut request = self.client.request(method, url);
        for (name, value) in &binding.headers {
            request = request.header(name, value);
        }
        if !binding.params.is_empty() {
            request = request.query(&binding.params);
        }
        Ok(request)
    }

    fn send(&self, binding: &Binding, default_method: Method) -> Result<Response, SluiceError> {
        let response = self.request(binding, default_method)?.send()?;
        Ok(response.error_for_status()?)
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn mode(&self) -> &'static str {
        "http"
    }

    fn fetch(&self, binding: &Binding, port: &Port, dir: &Path) -> Result<Value, SluiceError> {
        let mut response = self.send(binding, Method::GET)?;
        match effective_target(binding, port) {
            Target::Memory => Ok(Value::String(response.text()?)),
            Target::Filepath => {
                let path = dir.join(fetch_file_name(binding, port));
                let mut file = std::fs::File::create(&path)?;
                std::io::copy(&mut response, &mut file)?;
                debug!(path = %path.display(), "downloaded to file");
                Ok(Value::String(path.display().to_string()))
            }
        }
    }

    fn push(&self, data: &Value, binding: &mut Binding, _port: &Port) -> Result<(), SluiceError> {
        let body = value_bytes(data)?;
        self.request(binding, Method::POST)?
            .body(body)
            .send()?
            .error_for_status()?;
        Ok(())
    }

    fn stream_fetcher(&self, binding: &Binding) -> Result<Box<dyn StreamFetcher>, SluiceError> {
        let response = self.send(binding, Method::GET)?;
        Ok(Box::new(HttpStreamFetcher { response }))
    }

    fn stream_pusher(&self, binding: &Binding) -> Result<Box<dyn StreamPusher>, SluiceError> {
        let request = self.request(binding, Method::POST)?;
        let (read_end, write_end) = os_pipe()?;
        let handle = std::thread::spawn(move || -> Result<(), SluiceError> {
            let reader = std::fs::File::from(read_end);
            request
                .body(Body::new(reader))
                .send()?
                .error_for_status()?;
            Ok(())
        });
        Ok(Box::new(HttpStreamPusher {
            writer: Some(write_end.into()),
            handle: Some(handle),
        }))
    }
}

struct HttpStreamFetcher {
    response: Response,
}

impl StreamFetcher for HttpStreamFetcher {
    fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>, SluiceError> {
        let mut buf = vec![0u8; max];
        let n = self.response.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

struct HttpStreamPusher {
    writer: Option<std::fs::File>,
    handle: Option<JoinHandle<Result<(), SluiceError>>>,
}

impl StreamPusher for HttpStreamPusher {
    fn write(&mut self, data: &[u8]) -> Result<(), SluiceError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SluiceError::Transport("http stream already closed".into()))?;
        writer.write_all(data)?;
        Ok(())
    }

    /// Dropping the write end signals EOF to the request body; then the
    /// upload thread's outcome becomes this close's outcome.
    fn close(&mut self) -> Result<(), SluiceError> {
        self.writer = None;
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| SluiceError::Transport("http upload thread panicked".into()))??;
        }
        Ok(())
    }
}
