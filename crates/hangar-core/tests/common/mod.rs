//! Shared fixtures: a minimal single-purpose HTTP server and tar.gz
//! builders, so download tests run without touching the network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Serve the same HTTP response to every connection. Returns the URL and a
/// counter of requests handled.
pub async fn serve_fixed_response(
    status_line: &'static str,
    body: Vec<u8>,
) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            hits_clone.fetch_add(1, Ordering::SeqCst);

            // Drain the request head before responding
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;

            let header = format!(
                "{}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                status_line,
                body.len()
            );
            let _ = stream.write_all(header.as_bytes()).await;
            let _ = stream.write_all(&body).await;
        }
    });

    (format!("http://127.0.0.1:{}/engine.tar.gz", port), hits)
}

pub async fn serve_not_found() -> (String, Arc<AtomicUsize>) {
    serve_fixed_response("HTTP/1.1 404 Not Found", b"gone".to_vec()).await
}

pub async fn serve_archive(body: Vec<u8>) -> (String, Arc<AtomicUsize>) {
    serve_fixed_response("HTTP/1.1 200 OK", body).await
}

/// Serve a response whose body arrives in small timed chunks, so
/// cancellation mid-transfer has a chance to be observed.
pub async fn serve_dripping(total_chunks: usize, chunk_delay_ms: u64) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };

            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;

            let chunk = [0u8; 64];
            let header = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                chunk.len() * total_chunks
            );
            let _ = stream.write_all(header.as_bytes()).await;
            for _ in 0..total_chunks {
                if stream.write_all(&chunk).await.is_err() {
                    break;
                }
                let _ = stream.flush().await;
                tokio::time::sleep(std::time::Duration::from_millis(chunk_delay_ms)).await;
            }
        }
    });

    format!("http://127.0.0.1:{}/engine.tar.gz", port)
}

async fn read_request_head(stream: &mut TcpStream) -> String {
    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap_or(0);
    String::from_utf8_lossy(&buf[..n]).to_lowercase()
}

fn range_offset(request_head: &str) -> usize {
    request_head
        .split("range: bytes=")
        .nth(1)
        .and_then(|rest| rest.split('-').next())
        .and_then(|start| start.trim().parse().ok())
        .unwrap_or(0)
}

async fn respond_from_offset(stream: &mut TcpStream, body: &[u8], offset: usize) {
    let offset = offset.min(body.len());
    let rest = &body[offset..];
    let header = if offset > 0 {
        format!(
            "HTTP/1.1 206 Partial Content\r\ncontent-range: bytes {}-{}/{}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            offset,
            body.len().saturating_sub(1),
            body.len(),
            rest.len()
        )
    } else {
        format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            rest.len()
        )
    };
    let _ = stream.write_all(header.as_bytes()).await;
    let _ = stream.write_all(rest).await;
}

/// Serve `body` on every connection, honoring `Range` requests with a 206.
/// The flag records whether any request asked for a nonzero offset.
pub async fn serve_range_aware(body: Vec<u8>) -> (String, Arc<AtomicBool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let saw_range = Arc::new(AtomicBool::new(false));
    let saw_range_clone = saw_range.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let head = read_request_head(&mut stream).await;
            let offset = range_offset(&head);
            if offset > 0 {
                saw_range_clone.store(true, Ordering::SeqCst);
            }
            respond_from_offset(&mut stream, &body, offset).await;
        }
    });

    (format!("http://127.0.0.1:{}/engine.tar.gz", port), saw_range)
}

/// Serve a response that claims the full body length but closes the
/// connection after `partial` bytes, on every connection.
pub async fn serve_truncating(body: Vec<u8>, partial: usize) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            hits_clone.fetch_add(1, Ordering::SeqCst);
            let _ = read_request_head(&mut stream).await;

            let header = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(header.as_bytes()).await;
            let _ = stream.write_all(&body[..partial.min(body.len())]).await;
            let _ = stream.flush().await;
            // Dropping the stream here cuts the body short
        }
    });

    (format!("http://127.0.0.1:{}/engine.tar.gz", port), hits)
}

/// Cut the first connection off after `cut_at` bytes; serve the rest of the
/// body on later connections, honoring `Range`. The flag records whether a
/// follow-up request resumed from a nonzero offset.
pub async fn serve_interrupted_then_resume(
    body: Vec<u8>,
    cut_at: usize,
) -> (String, Arc<AtomicUsize>, Arc<AtomicBool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();
    let saw_range = Arc::new(AtomicBool::new(false));
    let saw_range_clone = saw_range.clone();

    tokio::spawn(async move {
        let mut first = true;
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            hits_clone.fetch_add(1, Ordering::SeqCst);
            let head = read_request_head(&mut stream).await;

            if first {
                first = false;
                let header = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(header.as_bytes()).await;
                let _ = stream.write_all(&body[..cut_at.min(body.len())]).await;
                let _ = stream.flush().await;
                continue;
            }

            let offset = range_offset(&head);
            if offset > 0 {
                saw_range_clone.store(true, Ordering::SeqCst);
            }
            respond_from_offset(&mut stream, &body, offset).await;
        }
    });

    (
        format!("http://127.0.0.1:{}/engine.tar.gz", port),
        hits,
        saw_range,
    )
}

/// Build a tar.gz archive in memory. Entries with a `.sh` name or a `bin/`
/// prefix are marked executable.
pub fn targz_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        let mode = if name.starts_with("bin/") || name.ends_with(".sh") {
            0o755
        } else {
            0o644
        };
        header.set_mode(mode);
        header.set_cksum();
        builder.append_data(&mut header, *name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}
