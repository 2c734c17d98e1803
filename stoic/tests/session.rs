//! End-to-end session scenarios over Unix socket pairs.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use stoic::{
    Client, Error, FailureCode, Invocation, LogLevel, Plugin, PluginContext, PluginError,
    PluginLoader, PluginResult, PluginStore, Server, ServerBuilder, Upload, sha256_hex,
};
use stoic_proto::{
    Flags, Frame, LoadPlugin, Message, MessageReader, MessageWriter, PROTOCOL_VERSION, Payload,
    ProtoError, STDERR, STDIN, STDOUT, StartPlugin, VerifyProtocolVersion, encode,
};

/// Serves uploaded artifacts by echoing their bytes to stdout.
struct EchoLoader;

impl PluginLoader for EchoLoader {
    fn load(&self, _name: &str, artifact: &Path) -> stoic::Result<Arc<dyn Plugin>> {
        let code = std::fs::read(artifact)?;
        Ok(Arc::new(
            move |ctx: &mut PluginContext, _: &[String]| -> PluginResult {
                ctx.stdout().write_all(&code)?;
                Ok(0)
            },
        ))
    }
}

fn cat(ctx: &mut PluginContext, _: &[String]) -> PluginResult {
    let mut input = Vec::new();
    ctx.stdin().read_to_end(&mut input)?;
    ctx.stdout().write_all(&input)?;
    Ok(0)
}

fn exit_seven(_: &mut PluginContext, _: &[String]) -> PluginResult {
    Err(PluginError::Exit(7))
}

fn greet(ctx: &mut PluginContext, args: &[String]) -> PluginResult {
    let name = ctx.getenv("GREETING").unwrap_or_default();
    writeln!(ctx.stdout(), "{name} {}", args.join(" "))?;
    ctx.log(LogLevel::Info, "info line")?;
    ctx.log(LogLevel::Error, "error line")?;
    Ok(0)
}

fn explode(_: &mut PluginContext, _: &[String]) -> PluginResult {
    panic!("plugin blew up")
}

fn builder() -> ServerBuilder {
    Server::builder()
        .error_grace(Duration::ZERO)
        .version_name("test")
        .loader(EchoLoader)
        .plugin("cat", cat)
        .plugin("exit-seven", exit_seven)
        .plugin("greet", greet)
        .plugin("explode", explode)
}

/// A server session on one end of a socket pair, driven frame by frame.
struct Peer {
    reader: MessageReader<UnixStream>,
    writer: MessageWriter<UnixStream>,
    socket: UnixStream,
    session: JoinHandle<stoic::Result<()>>,
    store: Arc<PluginStore>,
    _dir: tempfile::TempDir,
}

impl Peer {
    fn spawn(builder: ServerBuilder) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PluginStore::open(dir.path()).unwrap());
        let server = builder.store(Arc::clone(&store)).build().unwrap();
        let (local, remote) = UnixStream::pair().unwrap();
        let session = thread::spawn(move || server.serve_stream(remote));
        Self {
            reader: MessageReader::new(local.try_clone().unwrap()),
            socket: local.try_clone().unwrap(),
            writer: MessageWriter::new(local),
            session,
            store,
            _dir: dir,
        }
    }

    fn verify(&self, protocol_version: i32) -> i32 {
        self.writer
            .write_request(
                VerifyProtocolVersion {
                    protocol_version,
                    version_name: "peer".into(),
                },
                None,
                true,
            )
            .unwrap()
    }

    fn handshake(&mut self) {
        let id = self.verify(PROTOCOL_VERSION);
        assert!(matches!(self.response(id), Payload::Succeeded(_)));
    }

    fn start(&self, name: Option<&str>, sha: Option<&str>, args: &[&str]) -> i32 {
        self.writer
            .write_request(
                StartPlugin {
                    plugin_name: name.map(str::to_owned),
                    plugin_sha: sha.map(str::to_owned),
                    plugin_args: args.iter().map(|a| (*a).to_owned()).collect(),
                    min_log_level: LogLevel::Warn,
                    env: BTreeMap::from([("GREETING".to_owned(), "hi".to_owned())]),
                },
                None,
                true,
            )
            .unwrap()
    }

    fn upload(&mut self, name: &str, sha: &str, code: &[u8]) -> Payload {
        let id = self
            .writer
            .write_request(
                LoadPlugin {
                    plugin_name: Some(name.to_owned()),
                    plugin_sha: sha.to_owned(),
                },
                None,
                false,
            )
            .unwrap();
        self.writer.write_request(code.to_vec(), Some(id), true).unwrap();
        self.response(id)
    }

    fn response(&mut self, request_id: i32) -> Payload {
        let Message {
            flags,
            request_id: id,
            payload,
        } = self.reader.consume_next().unwrap();
        assert!(flags.is_response(), "expected a response, got {payload}");
        assert_eq!(id, request_id);
        payload
    }

    /// Shuts down our sending side; the session sees a clean disconnect.
    fn hang_up(&self) {
        self.socket.shutdown(Shutdown::Write).unwrap();
    }

    fn close_stdin(&self) {
        self.writer.write_one_way(Vec::new(), Some(STDIN), true).unwrap();
    }

    /// Collects plugin output up to `PluginFinished`.
    fn output(&mut self) -> (String, String, i32) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        loop {
            let message = self.reader.consume_next().unwrap();
            match message.payload {
                Payload::Raw(bytes) if message.request_id == STDOUT => out.extend(bytes),
                Payload::Raw(bytes) if message.request_id == STDERR => err.extend(bytes),
                Payload::PluginFinished(finished) => {
                    assert!(message.flags.is_one_way());
                    return (
                        String::from_utf8(out).unwrap(),
                        String::from_utf8(err).unwrap(),
                        finished.exit_code,
                    );
                }
                other => panic!("unexpected {other} while collecting output"),
            }
        }
    }

    /// Reads the one-way `ProtocolError` sent before teardown.
    fn protocol_error(&mut self) -> String {
        let message = self.reader.consume_next().unwrap();
        assert!(message.flags.is_one_way());
        match message.payload {
            Payload::ProtocolError(e) => e.message,
            other => panic!("expected ProtocolError, got {other}"),
        }
    }

    fn finish(self) -> stoic::Result<()> {
        self.session.join().unwrap()
    }
}

fn failure_code(payload: &Payload) -> FailureCode {
    match payload {
        Payload::Failed(failed) => failed.code(),
        other => panic!("expected Failed, got {other}"),
    }
}

#[test]
fn version_mismatch_is_fatal() {
    let mut peer = Peer::spawn(builder());
    let verify_id = peer.verify(PROTOCOL_VERSION - 1);
    peer.start(Some("cat"), None, &[]);

    assert_eq!(failure_code(&peer.response(verify_id)), FailureCode::Unspecified);
    // The start request is never answered: the session is gone.
    assert!(peer.reader.consume_next().is_err());
    assert!(matches!(
        peer.finish(),
        Err(Error::VersionMismatch { received, .. }) if received == PROTOCOL_VERSION - 1
    ));
}

#[test]
fn version_name_drift_is_not_fatal() {
    let mut peer = Peer::spawn(builder().version_name("server-build"));
    peer.handshake();
    let id = peer.start(Some("stoic-noop"), None, &[]);
    assert!(matches!(peer.response(id), Payload::Succeeded(_)));
    peer.close_stdin();
    assert_eq!(peer.output().2, 0);
    peer.finish().unwrap();
}

#[test]
fn missing_plugin_is_uploaded_then_started() {
    let code = b"uploaded plugin body";
    let sha = sha256_hex(code);
    let mut peer = Peer::spawn(builder());
    peer.handshake();

    let id = peer.start(Some("echo"), Some(&sha), &[]);
    assert_eq!(failure_code(&peer.response(id)), FailureCode::PluginMissing);

    assert!(matches!(peer.upload("echo", &sha, code), Payload::Succeeded(_)));
    assert!(peer.store.exists(Some("echo"), &sha));

    let id = peer.start(Some("echo"), Some(&sha), &[]);
    match peer.response(id) {
        Payload::Succeeded(ok) => assert_eq!(ok.message, "Plugin started"),
        other => panic!("expected Succeeded, got {other}"),
    }
    peer.close_stdin();
    let (out, err, exit_code) = peer.output();
    assert_eq!(out.as_bytes(), code);
    assert!(err.is_empty());
    assert_eq!(exit_code, 0);
    peer.finish().unwrap();
}

#[test]
fn stdin_frames_are_reassembled_until_close() {
    let mut peer = Peer::spawn(builder());
    peer.handshake();
    let id = peer.start(Some("cat"), None, &[]);
    assert!(matches!(peer.response(id), Payload::Succeeded(_)));

    for chunk in [&b"abc"[..], b"def", b"ghi"] {
        peer.writer.write_one_way(chunk.to_vec(), Some(STDIN), false).unwrap();
    }
    peer.close_stdin();

    // The plugin only finishes once its read loop sees end of input.
    let (out, _, exit_code) = peer.output();
    assert_eq!(out, "abcdefghi");
    assert_eq!(exit_code, 0);
    peer.finish().unwrap();
}

#[test]
fn exit_code_passes_through_without_protocol_error() {
    let mut peer = Peer::spawn(builder());
    peer.handshake();
    let id = peer.start(Some("exit-seven"), None, &[]);
    assert!(matches!(peer.response(id), Payload::Succeeded(_)));

    let (out, err, exit_code) = peer.output();
    assert_eq!(exit_code, 7);
    assert!(out.is_empty() && err.is_empty());

    peer.close_stdin();
    // Nothing but a clean hang-up follows.
    assert!(peer.reader.consume_next().unwrap_err().is_closed());
    peer.finish().unwrap();
}

#[test]
fn panicking_plugin_exits_with_one() {
    let mut peer = Peer::spawn(builder());
    peer.handshake();
    let id = peer.start(Some("explode"), None, &[]);
    assert!(matches!(peer.response(id), Payload::Succeeded(_)));
    peer.close_stdin();

    let (_, err, exit_code) = peer.output();
    assert_eq!(exit_code, stoic::FAILURE_EXIT_CODE);
    assert!(err.contains("plugin blew up"));
    peer.finish().unwrap();
}

#[test]
fn args_env_and_log_level_reach_the_plugin() {
    let mut peer = Peer::spawn(builder());
    peer.handshake();
    let id = peer.start(Some("greet"), None, &["there", "friend"]);
    assert!(matches!(peer.response(id), Payload::Succeeded(_)));
    peer.close_stdin();

    let (out, err, exit_code) = peer.output();
    assert_eq!(out, "hi there friend\n");
    assert_eq!(err, "error line\n");
    assert_eq!(exit_code, 0);
    peer.finish().unwrap();
}

#[test]
fn reupload_replaces_stored_code() {
    let mut peer = Peer::spawn(builder().verify_uploads(false));
    peer.handshake();

    assert!(matches!(peer.upload("echo", "fixed", b"first"), Payload::Succeeded(_)));
    assert!(matches!(peer.upload("echo", "fixed", b"second"), Payload::Succeeded(_)));
    let path = peer.store.path(Some("echo"), "fixed").unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"second");

    let id = peer.start(Some("echo"), Some("fixed"), &[]);
    assert!(matches!(peer.response(id), Payload::Succeeded(_)));
    peer.close_stdin();
    assert_eq!(peer.output().0, "second");
    peer.finish().unwrap();
}

#[test]
fn upload_with_wrong_hash_is_rejected() {
    let mut peer = Peer::spawn(builder());
    peer.handshake();

    let reply = peer.upload("echo", &sha256_hex(b"expected"), b"tampered");
    assert_eq!(failure_code(&reply), FailureCode::Unspecified);
    assert!(!peer.store.exists(Some("echo"), &sha256_hex(b"expected")));

    let reply = peer.upload("../escape", &sha256_hex(b"x"), b"x");
    assert_eq!(failure_code(&reply), FailureCode::Unspecified);

    peer.hang_up();
    assert!(peer.reader.consume_next().unwrap_err().is_closed());
    peer.session.join().unwrap().unwrap();
}

#[test]
fn unknown_builtin_is_reported_missing() {
    let mut peer = Peer::spawn(builder());
    peer.handshake();
    let id = peer.start(Some("no-such-plugin"), None, &[]);
    assert_eq!(failure_code(&peer.response(id)), FailureCode::PluginMissing);
    peer.hang_up();
    peer.session.join().unwrap().unwrap();
}

#[test]
fn start_without_identity_is_a_protocol_error() {
    let mut peer = Peer::spawn(builder());
    peer.handshake();
    peer.start(None, None, &[]);

    let message = peer.reader.consume_next().unwrap();
    assert!(message.flags.is_one_way());
    assert!(matches!(message.payload, Payload::ProtocolError(_)));
    assert!(matches!(peer.finish(), Err(Error::InvalidDispatch)));
}

#[test]
fn message_before_handshake_is_a_protocol_error() {
    let mut peer = Peer::spawn(builder());
    peer.start(Some("cat"), None, &[]);

    match peer.reader.consume_next().unwrap().payload {
        Payload::ProtocolError(e) => assert!(e.message.contains("before protocol version check")),
        other => panic!("expected ProtocolError, got {other}"),
    }
    assert!(matches!(peer.finish(), Err(Error::UnexpectedMessage(_))));
}

#[test]
fn unknown_payload_tag_tears_down_session() {
    let mut peer = Peer::spawn(builder());
    peer.handshake();
    let frame = Frame {
        flags: Flags::REQUEST | Flags::COMPLETE,
        request_id: 9,
        tag: 99,
        payload: b"junk".to_vec(),
    };
    encode(&mut &peer.socket, &frame).unwrap();

    assert!(peer.protocol_error().contains("unknown payload tag 99"));
    assert!(matches!(
        peer.finish(),
        Err(Error::Proto(ProtoError::UnknownPayloadTag(99)))
    ));
}

#[test]
fn truncated_frame_tears_down_session() {
    let mut peer = Peer::spawn(builder());
    peer.handshake();
    let mut partial = Vec::new();
    partial.extend_from_slice(&28u32.to_be_bytes());
    partial.extend_from_slice(&(Flags::REQUEST | Flags::COMPLETE).bits().to_be_bytes());
    partial.extend_from_slice(&9i32.to_be_bytes());
    partial.extend_from_slice(&1u32.to_be_bytes());
    partial.extend_from_slice(b"abc");
    (&peer.socket).write_all(&partial).unwrap();
    peer.hang_up();

    assert!(peer.protocol_error().contains("truncated frame"));
    assert!(matches!(
        peer.finish(),
        Err(Error::Proto(ProtoError::TruncatedFrame { .. }))
    ));
}

#[test]
fn complete_upload_descriptor_is_rejected() {
    let mut peer = Peer::spawn(builder());
    peer.handshake();
    peer.writer
        .write_request(
            LoadPlugin {
                plugin_name: Some("dump".to_owned()),
                plugin_sha: sha256_hex(b"code"),
            },
            None,
            true,
        )
        .unwrap();

    assert!(peer.protocol_error().contains("must be an incomplete request"));
    assert!(matches!(peer.finish(), Err(Error::UnexpectedMessage(_))));
}

#[test]
fn upload_code_must_be_a_request() {
    let mut peer = Peer::spawn(builder());
    peer.handshake();
    let sha = sha256_hex(b"code");
    let id = peer
        .writer
        .write_request(
            LoadPlugin {
                plugin_name: Some("dump".to_owned()),
                plugin_sha: sha.clone(),
            },
            None,
            false,
        )
        .unwrap();
    peer.writer
        .write_one_way(b"code".to_vec(), Some(id), true)
        .unwrap();

    assert!(peer.protocol_error().contains("expecting plugin code"));
    let store = Arc::clone(&peer.store);
    assert!(matches!(peer.finish(), Err(Error::UnexpectedMessage(_))));
    assert!(!store.exists(Some("dump"), &sha));
}

#[test]
fn builtins_report_status_and_list() {
    let mut peer = Peer::spawn(builder());
    peer.handshake();
    let id = peer.start(Some(stoic::STATUS), None, &[]);
    assert!(matches!(peer.response(id), Payload::Succeeded(_)));
    peer.close_stdin();
    let (out, _, exit_code) = peer.output();
    assert_eq!(exit_code, 0);
    assert!(out.contains(&format!("protocol-version: {PROTOCOL_VERSION}")));
    assert!(out.contains("version-name: test"));
    peer.finish().unwrap();

    let mut peer = Peer::spawn(builder());
    peer.handshake();
    let id = peer.start(Some(stoic::LIST), None, &[]);
    assert!(matches!(peer.response(id), Payload::Succeeded(_)));
    peer.close_stdin();
    let (out, _, _) = peer.output();
    let names: Vec<&str> = out.lines().collect();
    assert_eq!(
        names,
        ["cat", "exit-seven", "explode", "greet", "stoic-list", "stoic-noop", "stoic-status"]
    );
    peer.finish().unwrap();
}

type ClientPair = (
    Client<UnixStream, UnixStream>,
    JoinHandle<stoic::Result<()>>,
    tempfile::TempDir,
);

fn client_pair(builder: ServerBuilder) -> ClientPair {
    let dir = tempfile::tempdir().unwrap();
    let server = builder
        .store(PluginStore::open(dir.path()).unwrap())
        .build()
        .unwrap();
    let (local, remote) = UnixStream::pair().unwrap();
    let session = thread::spawn(move || server.serve_stream(remote));
    let client = Client::new(local.try_clone().unwrap(), local);
    (client, session, dir)
}

#[test]
fn client_uploads_missing_plugin_and_returns_exit_code() {
    let (client, session, _dir) = client_pair(builder());
    let upload = Upload::new("echo", b"from the client".to_vec());
    let mut out = Vec::new();
    let mut err = Vec::new();

    let code = client
        .run(&Invocation::uploaded(upload), io::empty(), &mut out, &mut err)
        .unwrap();

    assert_eq!(code, 0);
    assert_eq!(out, b"from the client");
    assert!(err.is_empty());
    session.join().unwrap().unwrap();
}

#[test]
fn client_forwards_stdin_until_end() {
    let (client, session, _dir) = client_pair(builder());
    let mut out = Vec::new();

    let code = client
        .run(
            &Invocation::builtin("cat"),
            io::Cursor::new(b"piped input".to_vec()),
            &mut out,
            &mut io::sink(),
        )
        .unwrap();

    assert_eq!(code, 0);
    assert_eq!(out, b"piped input");
    session.join().unwrap().unwrap();
}

#[test]
fn client_passes_args_env_and_exit_code() {
    let (client, session, _dir) = client_pair(builder());
    let mut out = Vec::new();
    let invocation = Invocation::builtin("greet")
        .args(["a", "b"])
        .env("GREETING", "hey")
        .min_log_level(LogLevel::Verbose);
    let mut err = Vec::new();

    let code = client.run(&invocation, io::empty(), &mut out, &mut err).unwrap();

    assert_eq!(code, 0);
    assert_eq!(out, b"hey a b\n");
    assert_eq!(err, b"info line\nerror line\n");
    session.join().unwrap().unwrap();

    let (client, session, _dir) = client_pair(builder());
    let code = client
        .run(
            &Invocation::builtin("exit-seven"),
            io::empty(),
            &mut io::sink(),
            &mut io::sink(),
        )
        .unwrap();
    assert_eq!(code, 7);
    session.join().unwrap().unwrap();
}

#[test]
fn client_reports_missing_builtin() {
    let (client, session, _dir) = client_pair(builder());
    let result = client.run(
        &Invocation::builtin("nope"),
        io::empty(),
        &mut io::sink(),
        &mut io::sink(),
    );
    assert!(matches!(result, Err(Error::PluginMissing(_))));
    session.join().unwrap().unwrap();
}

#[test]
fn socket_server_serves_many_connections() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("stoic.sock");
    let server = builder()
        .store(PluginStore::open(dir.path().join("store")).unwrap())
        .build()
        .unwrap();
    let listener = Server::bind(&socket).unwrap();
    thread::spawn(move || server.serve(&listener));

    let upload = Upload::new("echo", b"shared".to_vec());
    for _ in 0..3 {
        let mut out = Vec::new();
        let code = Client::connect(&socket)
            .unwrap()
            .run(
                &Invocation::uploaded(upload.clone()),
                io::empty(),
                &mut out,
                &mut io::sink(),
            )
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, b"shared");
    }

    // Binding again replaces the stale socket file.
    Server::bind(&socket).unwrap();
}
