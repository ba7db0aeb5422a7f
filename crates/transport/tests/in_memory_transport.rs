//! Integration tests for the DAP client over the in-memory transport

use std::io::{IsTerminal, Write};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use eyre::Result;
use tokio_util::codec::Encoder;
use tracing_subscriber::EnvFilter;
use transport::{
    Client, FrameCodec, FrameReader, Message,
    events,
    io::{InMemoryTransport, Transport},
    message::{Event, Response},
    requests,
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

fn write_message(writer: &mut impl Write, message: Message) -> Result<()> {
    let mut buf = BytesMut::new();
    FrameCodec::<Message>::new().encode(message, &mut buf)?;
    writer.write_all(&buf)?;
    Ok(())
}

fn reply(request_seq: i64, command: &str, body: serde_json::Value) -> Message {
    Message::Response(Response {
        seq: 0,
        request_seq,
        success: true,
        command: command.to_string(),
        message: None,
        body: Some(body),
    })
}

#[test]
fn basic_request_response_and_event() -> Result<()> {
    let (client_transport, adapter_transport) = InMemoryTransport::pair();
    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let client = Client::with_transport(client_transport, event_tx)?;

    let adapter = thread::spawn(move || -> Result<()> {
        let (reader, mut writer) = adapter_transport.split()?;
        let mut reader = FrameReader::<_, Message>::new(reader);
        let Some(Message::Request(request)) = reader.next_message()? else {
            eyre::bail!("expected initialize request");
        };
        assert_eq!(request.command, "initialize");
        write_message(
            &mut writer,
            reply(request.seq, "initialize", serde_json::json!({})),
        )?;
        write_message(
            &mut writer,
            Message::Event(Event {
                seq: 1,
                event: "initialized".to_string(),
                body: None,
            }),
        )?;
        Ok(())
    });

    let response = client.send(requests::RequestBody::Initialize(
        requests::Initialize::for_adapter("test"),
    ))?;
    assert!(response.success);

    let event = event_rx.recv_timeout(Duration::from_secs(5))?;
    assert!(matches!(event, events::Event::Initialized));

    adapter.join().expect("adapter thread panicked")?;
    Ok(())
}

#[test]
fn out_of_order_responses_are_matched_by_seq() -> Result<()> {
    let (client_transport, adapter_transport) = InMemoryTransport::pair();
    let (event_tx, _event_rx) = crossbeam_channel::unbounded();
    let client = Client::with_transport(client_transport, event_tx)?;

    let adapter = thread::spawn(move || -> Result<()> {
        let (reader, mut writer) = adapter_transport.split()?;
        let mut reader = FrameReader::<_, Message>::new(reader);
        let mut seqs = Vec::new();
        while seqs.len() < 2 {
            if let Some(Message::Request(request)) = reader.next_message()? {
                seqs.push((request.seq, request.command));
            }
        }
        // answer the second request first
        for (seq, command) in seqs.into_iter().rev() {
            write_message(
                &mut writer,
                reply(seq, &command, serde_json::json!({ "answer": seq })),
            )?;
        }
        Ok(())
    });

    let first_client = client.clone();
    let first = thread::spawn(move || first_client.send(requests::RequestBody::Threads));
    // make sure the first request is written before the second
    thread::sleep(Duration::from_millis(100));
    let second = client.send(requests::RequestBody::ConfigurationDone)?;
    let first = first.join().expect("request thread panicked")?;

    assert_eq!(first.command, "threads");
    assert_eq!(first.body.unwrap()["answer"], first.request_seq);
    assert_eq!(second.command, "configurationDone");
    assert_eq!(second.body.unwrap()["answer"], second.request_seq);

    adapter.join().expect("adapter thread panicked")?;
    Ok(())
}

#[test]
fn unanswered_request_times_out() -> Result<()> {
    let (client_transport, adapter_transport) = InMemoryTransport::pair();
    let (event_tx, _event_rx) = crossbeam_channel::unbounded();
    let client = Client::with_transport(client_transport, event_tx)?
        .with_timeout(Duration::from_millis(200));

    let err = client
        .send(requests::RequestBody::Threads)
        .expect_err("request should time out");
    assert!(err.to_string().contains("timed out"), "got: {err}");

    drop(adapter_transport);
    Ok(())
}

#[test]
fn closed_connection_fails_waiting_request() -> Result<()> {
    let (client_transport, adapter_transport) = InMemoryTransport::pair();
    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let client = Client::with_transport(client_transport, event_tx)?;

    let adapter = thread::spawn(move || -> Result<()> {
        let (reader, _writer) = adapter_transport.split()?;
        let mut reader = FrameReader::<_, Message>::new(reader);
        let _ = reader.next_message()?;
        // dropping both halves closes the connection
        Ok(())
    });

    let err = client
        .send(requests::RequestBody::Threads)
        .expect_err("request should fail");
    assert!(err.to_string().contains("connection closed"), "got: {err}");
    assert!(matches!(
        event_rx.recv_timeout(Duration::from_secs(5))?,
        events::Event::Terminated
    ));

    adapter.join().expect("adapter thread panicked")?;
    Ok(())
}
