//! In-process stand-in for the simulation sidecar, for tests.

use serde_json::{Value, json};
use tether_core::Credentials;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub(crate) fn credentials() -> Credentials {
    Credentials {
        host: "mc.example.net".to_string(),
        port: 25565,
        username: "Tether".to_string(),
        auth: None,
    }
}

pub(crate) struct FakeSidecar {
    listener: TcpListener,
}

impl FakeSidecar {
    pub(crate) async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    pub(crate) fn addr(&self) -> String {
        self.listener.local_addr().unwrap().to_string()
    }

    pub(crate) async fn accept(&self) -> SidecarConn {
        let (stream, _) = self.listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        SidecarConn {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }
}

/// What the sidecar answers to one request.
pub(crate) struct Reply {
    pub(crate) result: Result<Value, String>,
    /// Events written right after the response
    pub(crate) events: Vec<Value>,
}

impl Reply {
    pub(crate) fn ok() -> Self {
        Self {
            result: Ok(Value::Null),
            events: Vec::new(),
        }
    }

    pub(crate) fn with_result(result: Value) -> Self {
        Self {
            result: Ok(result),
            events: Vec::new(),
        }
    }

    pub(crate) fn then(mut self, event: Value) -> Self {
        self.events.push(event);
        self
    }
}

pub(crate) struct SidecarConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SidecarConn {
    pub(crate) async fn read_request(&mut self) -> Value {
        self.next_request().await.expect("request line")
    }

    async fn next_request(&mut self) -> Option<Value> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await.ok()? == 0 {
                return None;
            }
            if !line.trim().is_empty() {
                return serde_json::from_str(line.trim()).ok();
            }
        }
    }

    pub(crate) async fn send(&mut self, value: Value) {
        let mut line = serde_json::to_vec(&value).unwrap();
        line.push(b'\n');
        self.writer.write_all(&line).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub(crate) async fn reply_ok(&mut self, request: &Value, result: Value) {
        self.send(json!({"id": request["id"], "ok": true, "result": result}))
            .await;
    }

    pub(crate) async fn reply_err(&mut self, request: &Value, error: &str) {
        self.send(json!({"id": request["id"], "ok": false, "error": error}))
            .await;
    }

    /// Answers every request with `handler` until the client hangs up.
    pub(crate) async fn serve_with<F>(mut self, mut handler: F)
    where
        F: FnMut(&Value) -> Reply,
    {
        while let Some(request) = self.next_request().await {
            let reply = handler(&request);
            match reply.result {
                Ok(result) => self.reply_ok(&request, result).await,
                Err(error) => self.reply_err(&request, &error).await,
            }
            for event in reply.events {
                self.send(event).await;
            }
        }
    }
}
