//! End-to-end tests against a scripted SMTP server on the loopback interface.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pam_smtp::{StaticCredentials, VerificationOutcome, Verifier};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How the fake server behaves.
#[derive(Clone, Copy)]
struct Script {
    greeting: &'static str,
    capabilities: &'static [&'static str],
    password: &'static str,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: "220 mx.test ESMTP ready",
            capabilities: &["AUTH PLAIN LOGIN", "8BITMIME"],
            password: "hunter2",
        }
    }
}

/// Serves one connection and returns the lines the client sent.
fn serve_once(script: Script) -> (u16, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut writer = stream.try_clone().unwrap();
        let reader = BufReader::new(stream);
        let mut seen = Vec::new();

        write!(writer, "{}\r\n", script.greeting).unwrap();
        if !script.greeting.starts_with("220") {
            return seen;
        }

        for line in reader.lines() {
            let Ok(line) = line else { break };
            seen.push(line.clone());

            let mut parts = line.splitn(3, ' ');
            let verb = parts.next().unwrap_or("").to_ascii_uppercase();
            match verb.as_str() {
                "EHLO" => {
                    let mut reply = String::from("250-mx.test\r\n");
                    for (i, cap) in script.capabilities.iter().enumerate() {
                        let sep = if i + 1 == script.capabilities.len() { ' ' } else { '-' };
                        reply.push_str(&format!("250{}{}\r\n", sep, cap));
                    }
                    if script.capabilities.is_empty() {
                        reply = "250 mx.test\r\n".to_string();
                    }
                    writer.write_all(reply.as_bytes()).unwrap();
                }
                "AUTH" => {
                    let payload = parts.nth(1).unwrap_or("");
                    let decoded = BASE64.decode(payload).unwrap_or_default();
                    let expected = format!("\0alice@example.com\0{}", script.password);
                    if decoded == expected.as_bytes() {
                        writer.write_all(b"235 2.7.0 Authentication successful\r\n").unwrap();
                    } else {
                        writer
                            .write_all(b"535 5.7.8 Authentication credentials invalid\r\n")
                            .unwrap();
                    }
                }
                "QUIT" => {
                    writer.write_all(b"221 2.0.0 Bye\r\n").unwrap();
                    break;
                }
                _ => writer.write_all(b"502 5.5.2 Command not implemented\r\n").unwrap(),
            }
        }

        seen
    });

    (port, handle)
}

fn verifier(port: u16, extra: &[&str]) -> Verifier<pam_smtp::SmtpLoginClient> {
    let mut args = vec![format!("127.0.0.1:{}", port)];
    args.extend(extra.iter().map(|s| s.to_string()));
    args.push("timeout=2s".to_string());
    args.push("command_timeout=2s".to_string());
    Verifier::from_args(&args).unwrap()
}

fn verbs(seen: &[String]) -> Vec<String> {
    seen.iter()
        .map(|line| line.split(' ').take(2).collect::<Vec<_>>().join(" "))
        .map(|line| if line.starts_with("EHLO") { "EHLO".to_string() } else { line })
        .collect()
}

#[test]
fn test_accepted_login() {
    let (port, server) = serve_once(Script::default());

    let outcome = verifier(port, &["@example.com"]).run(&StaticCredentials::new("alice", "hunter2"));
    let seen = server.join().unwrap();

    assert_eq!(outcome, VerificationOutcome::Success);
    assert_eq!(verbs(&seen), vec!["EHLO", "AUTH PLAIN", "QUIT"]);
}

#[test]
fn test_rejected_login_still_quits() {
    let (port, server) = serve_once(Script::default());

    let outcome = verifier(port, &["@example.com"]).run(&StaticCredentials::new("alice", "wrong"));
    let seen = server.join().unwrap();

    match outcome {
        VerificationOutcome::AuthRejected(reason) => assert!(reason.contains("535")),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(verbs(&seen).last().map(String::as_str), Some("QUIT"));
}

#[test]
fn test_required_encryption_without_starttls() {
    let (port, server) = serve_once(Script::default());

    let outcome = verifier(port, &["starttls", "@example.com"])
        .run(&StaticCredentials::new("alice", "hunter2"));
    let seen = server.join().unwrap();

    assert!(matches!(outcome, VerificationOutcome::ConfigurationError(_)));
    assert_eq!(verbs(&seen), vec!["EHLO", "QUIT"]);
}

#[test]
fn test_no_auth_mechanism_is_configuration_error() {
    let (port, server) = serve_once(Script {
        capabilities: &["PIPELINING"],
        ..Script::default()
    });

    let outcome = verifier(port, &["@example.com"]).run(&StaticCredentials::new("alice", "hunter2"));
    let seen = server.join().unwrap();

    assert!(matches!(outcome, VerificationOutcome::ConfigurationError(_)));
    assert!(!seen.iter().any(|line| line.starts_with("AUTH")));
}

#[test]
fn test_refusing_greeting() {
    let (port, server) = serve_once(Script {
        greeting: "554 5.3.2 No service here",
        ..Script::default()
    });

    let outcome = verifier(port, &[]).run(&StaticCredentials::new("alice", "hunter2"));
    server.join().unwrap();

    assert!(matches!(outcome, VerificationOutcome::ConfigurationError(_)));
}

#[test]
fn test_connection_refused() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let outcome = verifier(port, &[]).run(&StaticCredentials::new("alice", "hunter2"));
    assert!(matches!(outcome, VerificationOutcome::ConfigurationError(_)));
}

#[test]
fn test_silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (_stream, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(800));
    });

    let args = vec![format!("127.0.0.1:{}", port), "command_timeout=200ms".to_string()];
    let outcome = Verifier::from_args(&args)
        .unwrap()
        .run(&StaticCredentials::new("alice", "hunter2"));
    server.join().unwrap();

    match outcome {
        VerificationOutcome::ConfigurationError(reason) => assert!(reason.contains("timed out")),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_endless_multiline_greeting_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        for _ in 0..40 {
            if stream.write_all(b"220-still greeting\r\n").is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
    });

    let args = vec![format!("127.0.0.1:{}", port), "command_timeout=300ms".to_string()];
    let started = Instant::now();
    let outcome = Verifier::from_args(&args)
        .unwrap()
        .run(&StaticCredentials::new("alice", "hunter2"));
    let elapsed = started.elapsed();
    server.join().unwrap();

    match outcome {
        VerificationOutcome::ConfigurationError(reason) => assert!(reason.contains("timed out")),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(elapsed < Duration::from_secs(2), "attempt took {:?}", elapsed);
}

#[test]
fn test_timed_out_session_skips_quit() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut writer = stream.try_clone().unwrap();
        writer.write_all(b"220 mx.test ESMTP ready\r\n").unwrap();

        // Never answers, just records what arrives until the client hangs up.
        BufReader::new(stream)
            .lines()
            .map_while(Result::ok)
            .collect::<Vec<_>>()
    });

    let args = vec![format!("127.0.0.1:{}", port), "command_timeout=500ms".to_string()];
    let started = Instant::now();
    let outcome = Verifier::from_args(&args)
        .unwrap()
        .run(&StaticCredentials::new("alice", "hunter2"));
    let elapsed = started.elapsed();
    let seen = server.join().unwrap();

    assert!(matches!(outcome, VerificationOutcome::ConfigurationError(_)));
    assert_eq!(verbs(&seen), vec!["EHLO"]);
    assert!(elapsed < Duration::from_millis(1000), "attempt took {:?}", elapsed);
}

#[test]
fn test_empty_password_never_connects() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    listener.set_nonblocking(true).unwrap();

    let outcome = verifier(port, &[]).run(&StaticCredentials::new("alice", ""));

    assert_eq!(
        outcome,
        VerificationOutcome::ConfigurationError("Password is empty.".to_string())
    );
    assert!(listener.accept().is_err());
}
