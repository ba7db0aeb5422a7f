//! Bridge tests against fake backends
use std::io::{IsTerminal, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::Receiver;
use eyre::Result;
use serde_json::{Value, json};
use server::{
    BridgeEvent, DebuggerBackend, JavaBridge, JavaSettings, OutputStream, PortRequest,
    PythonBridge, PythonSettings,
};
use tokio_util::codec::Encoder;
use tracing_subscriber::EnvFilter;
use transport::{
    FrameCodec, FrameReader, PortAllocator, PortProbe, Transport,
    io::InMemoryTransport,
    jsonrpc::{RequestMessage, ResponseMessage},
};

// test suite "constructor"
#[ctor::ctor]
fn init() {
    let in_ci = std::env::var("CI")
        .map(|val| val == "true")
        .unwrap_or(false);

    if std::io::stderr().is_terminal() || in_ci {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .try_init();
    }

    let _ = color_eyre::install();
}

struct Bound(bool);

impl PortProbe for Bound {
    fn is_bound(&self, _port: u16) -> bool {
        self.0
    }
}

fn next_ready(rx: &Receiver<BridgeEvent>) -> Result<server::DapEndpoint> {
    loop {
        match rx.recv_timeout(Duration::from_secs(5))? {
            BridgeEvent::Ready(endpoint) => return Ok(endpoint),
            BridgeEvent::Failed { error, .. } => eyre::bail!("bridge failed: {error}"),
            _ => {}
        }
    }
}

fn write_frame(writer: &mut impl Write, message: &impl serde::Serialize) -> Result<()> {
    let mut buf = BytesMut::new();
    FrameCodec::<Value>::new().encode(message, &mut buf)?;
    writer.write_all(&buf)?;
    Ok(())
}

fn fake_interpreter(dir: &Path, body: &str) -> Result<PathBuf> {
    let path = dir.join("fake-python");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

fn python_bridge(
    dir: &Path,
    interpreter_body: &str,
    bound: bool,
) -> Result<(PythonBridge, Receiver<BridgeEvent>)> {
    let interpreter = fake_interpreter(dir, interpreter_body)?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let settings = PythonSettings {
        interpreter: interpreter.display().to_string(),
        log_dir: dir.join("logs"),
        ready_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let bridge = PythonBridge::new(settings, PortAllocator::with_probe(Bound(false)), tx)
        .with_probe(Bound(bound));
    Ok((bridge, rx))
}

fn python_request(dir: &Path, session_id: &str) -> Result<PortRequest> {
    let script = dir.join("app.py");
    std::fs::write(&script, "print('hello')\n")?;
    Ok(PortRequest {
        session_id: session_id.to_string(),
        project_path: dir.to_path_buf(),
        target: Some(script),
        ..Default::default()
    })
}

fn is_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[test]
fn python_bridge_reports_ready_port() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut bridge, rx) = python_bridge(dir.path(), "exec sleep 30", true)?;

    bridge.request_port(python_request(dir.path(), "py-1")?)?;

    let endpoint = next_ready(&rx)?;
    assert_eq!(endpoint.port, 7000);
    assert_eq!(endpoint.kit, "python");
    assert_eq!(endpoint.session_id, "py-1");
    assert_eq!(endpoint.project_path, dir.path());
    Ok(())
}

#[test]
fn python_bridge_falls_back_to_fixed_bound() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut bridge, rx) = python_bridge(dir.path(), "exec sleep 30", false)?;

    bridge.request_port(python_request(dir.path(), "py-1")?)?;
    assert_eq!(next_ready(&rx)?.port, 7000);
    Ok(())
}

#[test]
fn second_python_request_closes_first_target() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut bridge, rx) = python_bridge(dir.path(), "exec sleep 30", true)?;

    bridge.request_port(python_request(dir.path(), "py-1")?)?;
    next_ready(&rx)?;
    let first = bridge.target_pid().expect("first target running");

    bridge.request_port(python_request(dir.path(), "py-2")?)?;
    let endpoint = next_ready(&rx)?;
    let second = bridge.target_pid().expect("second target running");

    assert_eq!(endpoint.session_id, "py-2");
    // the first reservation was released, so the same port comes back
    assert_eq!(endpoint.port, 7000);
    assert_ne!(first, second);
    assert!(!is_alive(first));
    assert!(is_alive(second));

    bridge.stop();
    assert!(!is_alive(second));
    Ok(())
}

#[test]
fn python_target_exiting_early_is_an_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut bridge, rx) = python_bridge(dir.path(), "echo 'No module named debugpy' >&2; exit 1", false)?;

    let err = bridge
        .request_port(python_request(dir.path(), "py-1")?)
        .unwrap_err();
    assert!(err.to_string().contains("exited"), "got: {err}");

    let output = loop {
        if let BridgeEvent::Output { stream, text, .. } = rx.recv_timeout(Duration::from_secs(5))? {
            break (stream, text);
        }
    };
    assert_eq!(
        output,
        (OutputStream::Stderr, "No module named debugpy".to_string())
    );
    Ok(())
}

#[test]
fn missing_interpreter_is_a_precondition_failure() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut bridge = PythonBridge::new(
        PythonSettings {
            interpreter: "no-such-python-interpreter".to_string(),
            ..Default::default()
        },
        PortAllocator::new(),
        tx,
    );

    let err = bridge
        .request_port(python_request(dir.path(), "py-1")?)
        .unwrap_err();
    assert!(err.to_string().contains("not found"), "got: {err}");
    assert!(rx.try_recv().is_err());
    Ok(())
}

/// Answers the handshake like the JDT language server with the debug plugin
fn fake_language_server(
    transport: InMemoryTransport,
    port: u16,
) -> thread::JoinHandle<Result<Vec<RequestMessage>>> {
    thread::spawn(move || {
        let (reader, mut writer) = transport.split()?;
        let mut reader = FrameReader::<_, RequestMessage>::new(reader);
        let mut seen = Vec::new();
        while let Some(request) = reader.next_message()? {
            let Some(id) = request.id else {
                continue;
            };
            let command = request.params.get("command").and_then(Value::as_str);
            let result = match (request.method.as_str(), command) {
                ("initialize", _) => {
                    write_frame(
                        &mut writer,
                        &json!({
                            "jsonrpc": "2.0",
                            "method": "window/logMessage",
                            "params": { "type": 3, "message": "Workspace initialized" },
                        }),
                    )?;
                    Some(json!({ "capabilities": {} }))
                }
                (_, Some("vscode.java.startDebugSession")) => Some(json!(port)),
                (_, Some("vscode.java.resolveMainClass")) => Some(json!([{
                    "mainClass": "com.example.App",
                    "projectName": "demo",
                }])),
                (_, Some("vscode.java.resolveClasspath")) => {
                    Some(json!([["/work/demo/build/classes"], []]))
                }
                _ => None,
            };
            seen.push(request);
            if let Some(result) = result {
                write_frame(&mut writer, &ResponseMessage::success(id, result))?;
            }
        }
        Ok(seen)
    })
}

#[test]
fn java_handshake_over_stdio() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (bridge_side, server_side) = InMemoryTransport::pair();
    let server = fake_language_server(server_side, 41234);

    let (tx, rx) = crossbeam_channel::unbounded();
    let mut bridge = JavaBridge::with_transport(
        JavaSettings::default(),
        PortAllocator::new(),
        tx,
        bridge_side,
    )?;

    let request = PortRequest {
        session_id: "java-1".to_string(),
        project_path: dir.path().to_path_buf(),
        target: Some(dir.path().join("src/App.java")),
        ..Default::default()
    };
    bridge.request_port(request.clone())?;

    let mut log_lines = Vec::new();
    let endpoint = loop {
        match rx.recv_timeout(Duration::from_secs(5))? {
            BridgeEvent::Ready(endpoint) => break endpoint,
            BridgeEvent::Output { stream, text, .. } => log_lines.push((stream, text)),
            other => eyre::bail!("unexpected event {other:?}"),
        }
    };
    assert_eq!(endpoint.port, 41234);
    assert_eq!(endpoint.kit, "java");
    let target = endpoint.java.expect("java target");
    assert_eq!(target.main_class, "com.example.App");
    assert_eq!(target.class_paths, vec!["/work/demo/build/classes"]);
    assert_eq!(
        log_lines,
        vec![(OutputStream::Normal, "Workspace initialized".to_string())]
    );

    // same workspace again: no second initialize, ids keep counting
    bridge.request_port(PortRequest {
        session_id: "java-2".to_string(),
        ..request
    })?;
    assert_eq!(next_ready(&rx)?.session_id, "java-2");

    drop(bridge);
    let seen = server.join().expect("server thread panicked")?;
    let methods: Vec<_> = seen
        .iter()
        .map(|r| (r.id, r.method.as_str()))
        .collect();
    assert_eq!(methods[0], (Some(1), "initialize"));
    assert_eq!(methods[1], (Some(2), "initialized"));
    assert_eq!(seen.iter().filter(|r| r.method == "initialize").count(), 1);
    let last_ids: Vec<_> = seen[5..].iter().map(|r| r.id).collect();
    assert_eq!(last_ids, vec![Some(6), Some(7), Some(8)]);
    Ok(())
}

#[test]
fn java_relative_project_path_is_rejected() -> Result<()> {
    let (bridge_side, _server_side) = InMemoryTransport::pair();
    let (tx, _rx) = crossbeam_channel::unbounded();
    let mut bridge = JavaBridge::with_transport(
        JavaSettings::default(),
        PortAllocator::new(),
        tx,
        bridge_side,
    )?;

    let err = bridge
        .request_port(PortRequest {
            session_id: "java-1".to_string(),
            project_path: PathBuf::from("relative/demo"),
            ..Default::default()
        })
        .unwrap_err();
    assert!(err.to_string().contains("absolute"));
    Ok(())
}
