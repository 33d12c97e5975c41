//! Drives the standard campaign handler against an in-process SMTP stub,
//! exercising the happy-path scenario (three recipients, all accepted) end
//! to end through a real job payload, in the style of
//! `bulkmail-dispatch`'s `engine_integration.rs`.

use std::sync::Arc;

use bulkmail::handler::CampaignHandler;
use bulkmail_scheduler::{Job, JobHandler};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

async fn spawn_accepting_stub() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                write_half.write_all(b"220 stub.example.com ESMTP\r\n").await.unwrap();

                let mut in_data = false;
                let mut line = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let command = line.trim_end();

                    if in_data {
                        if command == "." {
                            in_data = false;
                            write_half.write_all(b"250 message accepted\r\n").await.unwrap();
                        }
                        continue;
                    }

                    let upper = command.to_ascii_uppercase();
                    if upper.starts_with("EHLO") {
                        write_half.write_all(b"250 stub.example.com\r\n").await.unwrap();
                    } else if upper.starts_with("MAIL FROM") || upper.starts_with("RCPT TO") {
                        write_half.write_all(b"250 OK\r\n").await.unwrap();
                    } else if upper == "DATA" {
                        in_data = true;
                        write_half.write_all(b"354 go ahead\r\n").await.unwrap();
                    } else if upper == "QUIT" {
                        write_half.write_all(b"221 bye\r\n").await.unwrap();
                        return;
                    } else {
                        write_half.write_all(b"250 OK\r\n").await.unwrap();
                    }
                }
            });
        }
    });

    addr
}

#[tokio::test]
async fn happy_path_campaign_marks_every_recipient_sent() {
    let addr = spawn_accepting_stub().await;
    let (shutdown_tx, _) = bulkmail_common::signal::channel();

    let payload = json!({
        "smtp": {
            "host": addr.ip().to_string(),
            "port": addr.port(),
            "username": "user",
            "password": "pass",
            "from": "campaigns@example.com",
            "connection_timeout_secs": 5,
            "read_timeout_secs": 5,
            "write_timeout_secs": 5,
        },
        "recipients": [
            {"email": "alice@example.com", "attributes": {"name": "Alice"}},
            {"email": "bob@example.com", "attributes": {"name": "Bob"}},
            {"email": "carol@example.com", "attributes": {"name": "Carol"}},
        ],
        "subject_template": "Hi {{name}}",
        "concurrency": 1,
        "batch_size": 1,
        "retry_limit": 1,
    });

    let job = Job::new(serde_json::to_vec(&payload).unwrap(), 1, std::time::Duration::from_secs(1));
    let handler = CampaignHandler::new(
        Arc::new(bulkmail_dispatch::Monitor::new()),
        Arc::new(bulkmail_dispatch::TemplateCache::new(
            bulkmail_dispatch::TemplateCacheConfig::default(),
        )),
        shutdown_tx,
    );

    handler.handle(&job).await.unwrap();

    // Index 2 is `RecipientState::Sent`, index 0 is `Pending` (the
    // declared variant order), asserted the same way in
    // `bulkmail-dispatch`'s own engine integration test.
    let counters = handler.monitor().counters();
    assert_eq!(counters[2], 3, "all three recipients should reach Sent");
    assert_eq!(counters[0], 0, "no recipient should remain Pending");
}
