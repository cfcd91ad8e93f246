//! End-to-end scenarios over loopback TCP against a live server.
//!
//! Every test spins up a full server (ring, store, workers) on an ephemeral
//! port and talks to it with a plain blocking client. Environments that deny
//! io_uring (some seccomp sandboxes) skip rather than fail.

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::time::Duration;

use tempfile::TempDir;

use ftpring::{Config, Server};

const READ_TIMEOUT: Duration = Duration::from_secs(10);

struct TestServer {
    server: Server,
    _root: TempDir,
}

fn start_server(seed: &[(&str, &[u8])]) -> Option<TestServer> {
    let root = TempDir::new().unwrap();
    for (rel, contents) in seed {
        let path = root.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }
    let config = Config::new(root.path())
        .bind(Ipv4Addr::LOCALHOST)
        .port(0)
        .threads(2);
    let server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("skipping: cannot start server ({})", err);
            return None;
        }
    };
    server.start();
    Some(TestServer {
        server,
        _root: root,
    })
}

struct Client {
    reader: BufReader<TcpStream>,
}

impl Client {
    fn connect(addr: SocketAddrV4) -> Client {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
        let mut client = Client {
            reader: BufReader::new(stream),
        };
        // Greeting: two continuation lines and the final 220.
        assert_eq!(client.read_line(), "220-Connection Established\r\n");
        assert_eq!(client.read_line(), "220-Note that this server accepts only\r\n");
        assert_eq!(client.read_line(), "220 anonymous access mode.\r\n");
        client
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line
    }

    fn send(&mut self, command: &str) {
        let stream = self.reader.get_mut();
        stream.write_all(command.as_bytes()).unwrap();
        stream.flush().unwrap();
    }

    fn roundtrip(&mut self, command: &str) -> String {
        self.send(command);
        self.read_line()
    }

    fn login(&mut self) {
        assert_eq!(self.roundtrip("USER anonymous\r\n"), "230 User Name OK\r\n");
    }

    /// Issue PASV and connect a data socket to the announced endpoint.
    fn pasv(&mut self) -> TcpStream {
        let line = self.roundtrip("PASV\r\n");
        let addr = parse_pasv(&line);
        let data = TcpStream::connect(addr).unwrap();
        data.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
        data
    }
}

fn parse_pasv(line: &str) -> SocketAddrV4 {
    let open = line.find('(').expect("no opening parenthesis");
    let close = line.find(')').expect("no closing parenthesis");
    let fields: Vec<u16> = line[open + 1..close]
        .split(',')
        .map(|n| n.parse().unwrap())
        .collect();
    assert_eq!(fields.len(), 6, "malformed 227: {}", line);
    let ip = Ipv4Addr::new(
        fields[0] as u8,
        fields[1] as u8,
        fields[2] as u8,
        fields[3] as u8,
    );
    SocketAddrV4::new(ip, fields[4] * 256 + fields[5])
}

#[test]
fn anonymous_login_and_pwd() {
    let Some(ts) = start_server(&[]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    client.login();
    assert_eq!(client.roundtrip("PWD\r\n"), "200 /\r\n");
}

#[test]
fn commands_require_login() {
    let Some(ts) = start_server(&[]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    assert_eq!(client.roundtrip("LIST\r\n"), "530 Not Logged In\r\n");
    assert_eq!(client.roundtrip("PWD\r\n"), "530 Not Logged In\r\n");
}

#[test]
fn login_verb_is_case_insensitive() {
    let Some(ts) = start_server(&[]) else { return };
    for verb in ["user", "USER", "UsEr"] {
        let mut client = Client::connect(ts.server.local_addr());
        assert_eq!(
            client.roundtrip(&format!("{} anonymous\r\n", verb)),
            "230 User Name OK\r\n"
        );
        assert_eq!(client.roundtrip("PWD\r\n"), "200 /\r\n");
    }
}

#[test]
fn wrong_user_logs_out() {
    let Some(ts) = start_server(&[]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    client.login();
    assert_eq!(
        client.roundtrip("USER somebody\r\n"),
        "530 User Name Incorrect\r\n"
    );
    assert_eq!(client.roundtrip("PWD\r\n"), "530 Not Logged In\r\n");
}

#[test]
fn type_negotiation() {
    let Some(ts) = start_server(&[]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    client.login();
    assert_eq!(client.roundtrip("TYPE A\r\n"), "200 Type changed\r\n");
    assert_eq!(client.roundtrip("TYPE I\r\n"), "200 Type changed\r\n");
    assert_eq!(
        client.roundtrip("TYPE Q\r\n"),
        "501 Invalid/Unsupported TYPE parameter\r\n"
    );
    assert_eq!(client.roundtrip("STRU F\r\n"), "200 Structure changed\r\n");
    assert_eq!(client.roundtrip("MODE S\r\n"), "200 Mode changed\r\n");
    assert_eq!(
        client.roundtrip("MODE B\r\n"),
        "501 Invalid/Unsupported MODE parameter\r\n"
    );
}

#[test]
fn unknown_command_is_rejected() {
    let Some(ts) = start_server(&[]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    client.login();
    assert_eq!(client.roundtrip("FROB x\r\n"), "500 Incorrect Command\r\n");
    assert_eq!(
        client.roundtrip("PORT 1,2,3,4,5,6\r\n"),
        "500 Command unavailable\r\n"
    );
}

#[test]
fn path_escapes_are_rejected() {
    let Some(ts) = start_server(&[("foo/keep.txt", b"x")]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    client.login();
    assert_eq!(client.roundtrip("CWD ../..\r\n"), "550 Illegal path\r\n");
    assert_eq!(client.roundtrip("CWD foo/.tmp\r\n"), "550 Illegal path\r\n");
    assert_eq!(
        client.roundtrip("CWD missing\r\n"),
        "550 File does not exist\r\n"
    );
    assert_eq!(
        client.roundtrip("CWD foo/keep.txt\r\n"),
        "550 Specified path is not a directory\r\n"
    );
    assert_eq!(client.roundtrip("CWD foo\r\n"), "200 Directory changed\r\n");
    assert_eq!(client.roundtrip("PWD\r\n"), "200 /foo\r\n");
    assert_eq!(client.roundtrip("CDUP\r\n"), "200 Directory changed\r\n");
    assert_eq!(client.roundtrip("PWD\r\n"), "200 /\r\n");
    assert_eq!(client.roundtrip("CDUP\r\n"), "550 Path not found\r\n");
}

#[test]
fn transfer_without_pasv_does_not_hang() {
    let Some(ts) = start_server(&[("a.txt", b"x")]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    client.login();
    assert_eq!(client.roundtrip("RETR a.txt\r\n"), "425 Use PASV first.\r\n");
    // The control channel is still alive.
    assert_eq!(client.roundtrip("NOOP\r\n"), "200 Ok\r\n");
}

#[test]
fn pasv_then_list_root() {
    let Some(ts) = start_server(&[("one.txt", b"1"), ("two.txt", b"22")]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    client.login();

    let mut data = client.pasv();
    assert_eq!(client.roundtrip("LIST \r\n"), "150 Opened data connection\r\n");
    let mut listing = String::new();
    data.read_to_string(&mut listing).unwrap();
    assert_eq!(client.read_line(), "250 Operation successful\r\n");
    assert!(listing.contains("one.txt"), "listing was: {}", listing);
    assert!(listing.contains("two.txt"), "listing was: {}", listing);
}

#[test]
fn list_of_file_is_rejected() {
    let Some(ts) = start_server(&[("one.txt", b"1")]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    client.login();
    assert_eq!(
        client.roundtrip("LIST one.txt\r\n"),
        "501 specified path is not a directory\r\n"
    );
}

#[test]
fn retr_sends_file_with_ascii_translation() {
    let Some(ts) = start_server(&[("hello.txt", b"Hi\nthere\n")]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    client.login();
    assert_eq!(client.roundtrip("TYPE A\r\n"), "200 Type changed\r\n");

    let mut data = client.pasv();
    assert_eq!(
        client.roundtrip("RETR hello.txt\r\n"),
        "150 Opened data connection\r\n"
    );
    let mut body = Vec::new();
    data.read_to_end(&mut body).unwrap();
    assert_eq!(client.read_line(), "250 Operation successful\r\n");
    assert_eq!(body, b"Hi\r\nthere\r\n");
}

#[test]
fn retr_in_image_mode_is_untranslated() {
    let payload: &[u8] = b"bin\n\x00\x01\xff\n";
    let Some(ts) = start_server(&[("blob.bin", payload)]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    client.login();
    assert_eq!(client.roundtrip("TYPE I\r\n"), "200 Type changed\r\n");

    let mut data = client.pasv();
    assert_eq!(
        client.roundtrip("RETR blob.bin\r\n"),
        "150 Opened data connection\r\n"
    );
    let mut body = Vec::new();
    data.read_to_end(&mut body).unwrap();
    assert_eq!(client.read_line(), "250 Operation successful\r\n");
    assert_eq!(body, payload);
}

#[test]
fn retr_failures_use_data_command_codes() {
    let Some(ts) = start_server(&[("dir/x.txt", b"x")]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    client.login();
    assert_eq!(
        client.roundtrip("RETR ../oops\r\n"),
        "501 Illegal path\r\n"
    );
    assert_eq!(
        client.roundtrip("RETR missing.txt\r\n"),
        "501 File does not exist\r\n"
    );
    assert_eq!(
        client.roundtrip("RETR dir\r\n"),
        "501 Specified path is a directory\r\n"
    );
}

#[test]
fn stor_then_retr_round_trip() {
    let Some(ts) = start_server(&[("hello.txt", b"old contents\n")]) else { return };
    let addr = ts.server.local_addr();
    let mut client = Client::connect(addr);
    client.login();
    assert_eq!(client.roundtrip("TYPE A\r\n"), "200 Type changed\r\n");

    // STOR on a missing path is refused outright.
    assert_eq!(
        client.roundtrip("STOR brand-new.txt\r\n"),
        "501 File does not exist\r\n"
    );

    // Upload: "Hi\n" travels as "Hi\r\n" in ASCII mode.
    let mut data = client.pasv();
    assert_eq!(
        client.roundtrip("STOR hello.txt\r\n"),
        "150 Opened data connection\r\n"
    );
    data.write_all(b"Hi\r\n").unwrap();
    drop(data);
    assert_eq!(client.read_line(), "250 Operation successful\r\n");

    // Download it again; the stored "Hi\n" expands back to "Hi\r\n".
    let mut data = client.pasv();
    assert_eq!(
        client.roundtrip("RETR hello.txt\r\n"),
        "150 Opened data connection\r\n"
    );
    let mut body = Vec::new();
    data.read_to_end(&mut body).unwrap();
    assert_eq!(client.read_line(), "250 Operation successful\r\n");
    assert_eq!(body, b"Hi\r\n");

    assert_eq!(client.roundtrip("QUIT\r\n"), "221 Bye\r\n");

    // Shutdown reconciles versions: one canonical file, no .tmp residue.
    let root = ts._root.path().to_path_buf();
    ts.server.stop();
    assert_eq!(fs::read(root.join("hello.txt")).unwrap(), b"Hi\n");
    assert!(!root.join(".tmp").exists());
}

#[test]
fn cwd_then_transfer_resolves_against_working_directory() {
    let Some(ts) = start_server(&[("pub/docs/readme.txt", b"nested\n")]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    client.login();
    assert_eq!(client.roundtrip("TYPE A\r\n"), "200 Type changed\r\n");
    assert_eq!(client.roundtrip("CWD pub\r\n"), "200 Directory changed\r\n");

    let mut data = client.pasv();
    assert_eq!(
        client.roundtrip("RETR docs/readme.txt\r\n"),
        "150 Opened data connection\r\n"
    );
    let mut body = Vec::new();
    data.read_to_end(&mut body).unwrap();
    assert_eq!(client.read_line(), "250 Operation successful\r\n");
    assert_eq!(body, b"nested\r\n");

    let mut data = client.pasv();
    assert_eq!(
        client.roundtrip("LIST docs\r\n"),
        "150 Opened data connection\r\n"
    );
    let mut listing = String::new();
    data.read_to_string(&mut listing).unwrap();
    assert_eq!(client.read_line(), "250 Operation successful\r\n");
    assert!(listing.contains("readme.txt"), "listing was: {}", listing);
}

#[test]
fn pipelined_commands_are_processed_in_order() {
    let Some(ts) = start_server(&[]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    // One write carrying three commands; replies must come back one per
    // line, in order.
    client.send("USER anonymous\r\nTYPE A\r\nNOOP\r\n");
    assert_eq!(client.read_line(), "230 User Name OK\r\n");
    assert_eq!(client.read_line(), "200 Type changed\r\n");
    assert_eq!(client.read_line(), "200 Ok\r\n");
}

#[test]
fn overlong_line_is_rejected_without_hanging() {
    let Some(ts) = start_server(&[]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    let long = format!("USER {}\r\n", "x".repeat(8000));
    client.send(&long);
    assert_eq!(client.read_line(), "500 Incorrect Command\r\n");
}

#[test]
fn quit_closes_the_connection() {
    let Some(ts) = start_server(&[]) else { return };
    let mut client = Client::connect(ts.server.local_addr());
    assert_eq!(client.roundtrip("QUIT\r\n"), "221 Bye\r\n");
    let mut rest = String::new();
    // Server side closes after the goodbye drains.
    client.reader.read_to_string(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn two_clients_are_served_concurrently() {
    let Some(ts) = start_server(&[]) else { return };
    let addr = ts.server.local_addr();
    let mut first = Client::connect(addr);
    let mut second = Client::connect(addr);
    first.login();
    second.login();
    assert_eq!(first.roundtrip("NOOP\r\n"), "200 Ok\r\n");
    assert_eq!(second.roundtrip("NOOP\r\n"), "200 Ok\r\n");
}

#[test]
fn concurrent_reader_sees_pre_stor_snapshot() {
    // Big enough that the transfer cannot fit in the loopback socket
    // buffers: the reader genuinely holds its version open while the
    // writer replaces the file.
    let before = vec![b'x'; 32 << 20];
    let Some(ts) = start_server(&[("shared.txt", before.as_slice())]) else { return };
    let addr = ts.server.local_addr();

    let mut reader = Client::connect(addr);
    reader.login();
    assert_eq!(reader.roundtrip("TYPE I\r\n"), "200 Type changed\r\n");
    let mut reader_data = reader.pasv();
    assert_eq!(
        reader.roundtrip("RETR shared.txt\r\n"),
        "150 Opened data connection\r\n"
    );

    // With the reader stalled mid-transfer, replace the file.
    let mut writer = Client::connect(addr);
    writer.login();
    assert_eq!(writer.roundtrip("TYPE I\r\n"), "200 Type changed\r\n");
    let mut writer_data = writer.pasv();
    assert_eq!(
        writer.roundtrip("STOR shared.txt\r\n"),
        "150 Opened data connection\r\n"
    );
    writer_data.write_all(b"after").unwrap();
    drop(writer_data);
    assert_eq!(writer.read_line(), "250 Operation successful\r\n");

    // The in-flight reader still gets the pre-STOR bytes in full.
    let mut body = Vec::new();
    reader_data.read_to_end(&mut body).unwrap();
    assert_eq!(reader.read_line(), "250 Operation successful\r\n");
    assert_eq!(body.len(), before.len());
    assert_eq!(body, before);

    // A fresh reader observes the replacement.
    let mut late = Client::connect(addr);
    late.login();
    assert_eq!(late.roundtrip("TYPE I\r\n"), "200 Type changed\r\n");
    let mut late_data = late.pasv();
    assert_eq!(
        late.roundtrip("RETR shared.txt\r\n"),
        "150 Opened data connection\r\n"
    );
    let mut body = Vec::new();
    late_data.read_to_end(&mut body).unwrap();
    assert_eq!(late.read_line(), "250 Operation successful\r\n");
    assert_eq!(body, b"after");
}
