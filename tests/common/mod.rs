#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use photo_logger::capture::backends::stub::STUB_JPEG;
use photo_logger::{CommandRunner, CommandSpec, ProcessOutcome, Shutdown};

/// One request as the collector saw it.
#[derive(Clone, Debug)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// A local HTTP collector that records every request and answers with a
/// scripted status. The last status repeats once the script runs out.
pub struct Collector {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    _handle: JoinHandle<()>,
}

impl Collector {
    pub fn start(statuses: &[u16]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind collector");
        let addr = listener.local_addr().expect("collector addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let mut script: VecDeque<u16> = statuses.iter().copied().collect();
        let mut last = *statuses.last().unwrap_or(&200);
        let recorded = Arc::clone(&requests);
        let handle = thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let status = script.pop_front().unwrap_or(last);
                last = status;
                let _ = serve(stream, status, &recorded);
            }
        });
        Self {
            addr,
            requests,
            _handle: handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/upload", self.addr)
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

fn serve(stream: TcpStream, status: u16, recorded: &Mutex<Vec<ReceivedRequest>>) -> Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    let mut content_type = String::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse()?,
                "content-type" => content_type = value.trim().to_string(),
                _ => {}
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;
    recorded.lock().expect("requests lock").push(ReceivedRequest {
        method,
        path,
        content_type,
        body,
    });

    let reply = format!("status {}", status);
    let response = format!(
        "HTTP/1.1 {} Scripted\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reply.len(),
        reply
    );
    let mut stream = reader.into_inner();
    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// A loopback address with nothing listening on it.
pub fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind unused port");
    let addr = listener.local_addr().expect("unused addr");
    drop(listener);
    format!("http://{}/upload", addr)
}

/// Body of the named multipart field.
pub fn multipart_field(content_type: &str, body: &[u8], name: &str) -> Option<Vec<u8>> {
    let boundary = content_type.split("boundary=").nth(1)?.trim();
    let delimiter = format!("--{}", boundary);
    let marker = format!("name=\"{}\"", name);

    let mut rest = body;
    while let Some(start) = find(rest, delimiter.as_bytes()) {
        rest = &rest[start + delimiter.len()..];
        let headers_end = find(rest, b"\r\n\r\n")?;
        let headers = String::from_utf8_lossy(&rest[..headers_end]);
        let content = &rest[headers_end + 4..];
        let end = find(content, format!("\r\n{}", delimiter).as_bytes())?;
        if headers.contains(&marker) {
            return Some(content[..end].to_vec());
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// What a [`ScriptedRunner`] does for one invocation.
#[derive(Clone, Debug)]
pub enum Step {
    /// Exit with the code and stdout, touching nothing.
    Exit { code: i32, stdout: String },
    /// Write a JPEG to the command's last argument and exit 0.
    WriteOutput,
    /// Block until the bound expires or shutdown fires.
    Hang,
    /// Request shutdown as if a signal arrived mid-command.
    RequestShutdown,
}

impl Step {
    pub fn ok(stdout: &str) -> Self {
        Self::Exit {
            code: 0,
            stdout: stdout.to_string(),
        }
    }

    pub fn fail(code: i32) -> Self {
        Self::Exit {
            code,
            stdout: String::new(),
        }
    }
}

/// [`CommandRunner`] that plays back a script and records every command.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    steps: Arc<Mutex<VecDeque<Step>>>,
    calls: Arc<Mutex<Vec<CommandSpec>>>,
}

impl ScriptedRunner {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into())),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &mut self,
        spec: &CommandSpec,
        timeout: Duration,
        shutdown: &Shutdown,
    ) -> Result<ProcessOutcome> {
        self.calls.lock().expect("calls lock").push(spec.clone());
        let step = self
            .steps
            .lock()
            .expect("steps lock")
            .pop_front()
            .unwrap_or_else(|| Step::fail(127));
        Ok(match step {
            Step::Exit { code, stdout } => ProcessOutcome::Exited {
                code: Some(code),
                stdout,
                stderr: String::new(),
            },
            Step::WriteOutput => {
                if let Some(path) = spec.args.last() {
                    std::fs::write(path, STUB_JPEG)?;
                }
                ProcessOutcome::Exited {
                    code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                }
            }
            Step::RequestShutdown => {
                shutdown.request();
                ProcessOutcome::Interrupted
            }
            Step::Hang => {
                let started = Instant::now();
                if shutdown.wait_timeout(timeout) {
                    ProcessOutcome::Interrupted
                } else {
                    ProcessOutcome::TimedOut {
                        after: started.elapsed(),
                    }
                }
            }
        })
    }
}
