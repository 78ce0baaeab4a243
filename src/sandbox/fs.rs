//! The `fs` built-in
//!
//! Sync calls are served from the context's mirror of the virtual
//! filesystem (filled by `write-virtual-entry`); writes update the mirror
//! and are forwarded to the supervisor, and a refused forward is logged as
//! an error. Async calls always go through the supervisor.

use super::bootstrap::ProcessObject;
use super::buffer::Buffer;
use super::syscall::SyscallClient;
use crate::kernel::executor::Spawner;
use crate::kernel::pending::Reply;
use crate::kernel::protocol::{self, CallId, FromContext, LogLevel};
use crate::vfs::{self, DirEntry, FileSystem, MemoryFs, Metadata};
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use std::cell::RefCell;
use std::rc::Rc;

/// The context-local copy of the filesystem
pub type Mirror = Rc<RefCell<MemoryFs>>;

#[derive(Clone)]
pub struct FsModule {
    mirror: Mirror,
    client: SyscallClient,
    process: ProcessObject,
    spawner: Spawner,
}

impl FsModule {
    pub fn new(mirror: Mirror, client: SyscallClient, process: ProcessObject, spawner: Spawner) -> Self {
        Self {
            mirror,
            client,
            process,
            spawner,
        }
    }

    fn resolve(&self, p: &str) -> String {
        self.process.resolve(p)
    }

    /// Send a sync mutation on to the supervisor without waiting for it
    fn forward<F>(&self, action: &'static str, p: &str, build: F)
    where
        F: FnOnce(CallId) -> FromContext,
    {
        let reply = self.client.call(build);
        let client = self.client.clone();
        let p = p.to_string();
        self.spawner.spawn(async move {
            if let Err(e) = reply.await {
                client.send(FromContext::Log {
                    text: format!("[fs] {} {} failed: {}", action, p, e),
                    level: LogLevel::Error,
                });
            }
        });
    }

    // ========================================================================
    // Sync, against the mirror
    // ========================================================================

    pub fn read_file_sync(&self, p: &str) -> Result<Buffer, String> {
        let p = self.resolve(p);
        self.mirror
            .borrow()
            .read_file(&p)
            .map(Buffer::from)
            .map_err(|e| e.to_string())
    }

    pub fn read_to_string_sync(&self, p: &str) -> Result<String, String> {
        let p = self.resolve(p);
        vfs::read_to_string(&*self.mirror.borrow(), &p).map_err(|e| e.to_string())
    }

    /// Write locally, then forward. The forwarded write is not awaited.
    pub fn write_file_sync(&self, p: &str, data: &[u8]) -> Result<(), String> {
        let p = self.resolve(p);
        self.mirror
            .borrow_mut()
            .write_file(&p, data)
            .map_err(|e| e.to_string())?;
        self.forward("write", &p, |id| FromContext::FsWrite {
            id,
            path: p.clone(),
            content: data.to_vec(),
        });
        Ok(())
    }

    pub fn exists_sync(&self, p: &str) -> bool {
        self.mirror.borrow().exists(&self.resolve(p))
    }

    pub fn readdir_sync(&self, p: &str) -> Result<Vec<DirEntry>, String> {
        let p = self.resolve(p);
        self.mirror.borrow().list_files(&p).map_err(|e| e.to_string())
    }

    pub fn stat_sync(&self, p: &str) -> Result<Metadata, String> {
        let p = self.resolve(p);
        self.mirror.borrow().stat(&p).map_err(|e| e.to_string())
    }

    /// Recursive, like `mkdir -p`
    pub fn mkdir_sync(&self, p: &str) -> Result<(), String> {
        let p = self.resolve(p);
        vfs::create_dir_all(&mut *self.mirror.borrow_mut(), &p).map_err(|e| e.to_string())?;
        self.forward("mkdir", &p, |id| FromContext::FsMkdir { id, path: p.clone() });
        Ok(())
    }

    pub fn rm_sync(&self, p: &str) -> Result<(), String> {
        let p = self.resolve(p);
        self.mirror.borrow_mut().remove(&p).map_err(|e| e.to_string())?;
        self.forward("rm", &p, |id| FromContext::FsRemove { id, path: p.clone() });
        Ok(())
    }

    // ========================================================================
    // Async, through the supervisor
    // ========================================================================

    pub async fn read_file(&self, p: &str) -> Result<Buffer, String> {
        let path = self.resolve(p);
        let reply = self.client.call(|id| FromContext::FsRead {
            id,
            path,
            as_text: false,
        });
        let encoded: String = settle(reply).await?;
        protocol::decode_base64(&encoded).map(Buffer::from)
    }

    pub async fn read_to_string(&self, p: &str) -> Result<String, String> {
        let path = self.resolve(p);
        let reply = self.client.call(|id| FromContext::FsRead {
            id,
            path,
            as_text: true,
        });
        settle(reply).await
    }

    pub async fn write_file(&self, p: &str, data: &[u8]) -> Result<(), String> {
        let path = self.resolve(p);
        let reply = self.client.call(|id| FromContext::FsWrite {
            id,
            path: path.clone(),
            content: data.to_vec(),
        });
        let _: Json = settle(reply).await?;

        // Keep sync readers consistent with what the supervisor now has
        let mut mirror = self.mirror.borrow_mut();
        if vfs::create_dir_all(&mut *mirror, &vfs::path::dirname(&path)).is_ok() {
            let _ = mirror.write_file(&path, data);
        }
        Ok(())
    }

    pub async fn readdir(&self, p: &str) -> Result<Vec<DirEntry>, String> {
        let path = self.resolve(p);
        settle(self.client.call(|id| FromContext::FsList { id, path })).await
    }

    pub async fn mkdir(&self, p: &str) -> Result<(), String> {
        let path = self.resolve(p);
        let _: Json = settle(self.client.call(|id| FromContext::FsMkdir { id, path })).await?;
        Ok(())
    }

    pub async fn rm(&self, p: &str) -> Result<(), String> {
        let path = self.resolve(p);
        let _: Json = settle(self.client.call(|id| FromContext::FsRemove { id, path })).await?;
        Ok(())
    }

    pub async fn stat(&self, p: &str) -> Result<Metadata, String> {
        let path = self.resolve(p);
        settle(self.client.call(|id| FromContext::FsStat { id, path })).await
    }
}

async fn settle<T: DeserializeOwned>(reply: Reply<Json>) -> Result<T, String> {
    let value = reply.await.map_err(|e| e.to_string())?;
    serde_json::from_value(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::executor::Executor;
    use crate::kernel::ipc::{Receiver, channel};
    use crate::sandbox::bootstrap::ProcessSetup;
    use futures::FutureExt;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn module() -> (FsModule, SyscallClient, Receiver<FromContext>, Executor) {
        let (tx, rx) = channel();
        let client = SyscallClient::new(tx);
        let process = ProcessObject::new(
            ProcessSetup {
                pid: 1,
                script: "/app/main.js".to_string(),
                env: BTreeMap::new(),
                columns: 80,
                rows: 24,
            },
            client.clone(),
        );
        let mut mirror = MemoryFs::new();
        mirror.create_dir("/app").unwrap();
        let executor = Executor::new();
        let fs = FsModule::new(Rc::new(RefCell::new(mirror)), client.clone(), process, executor.spawner());
        (fs, client, rx, executor)
    }

    #[test]
    fn test_sync_write_updates_mirror_and_forwards() {
        let (fs, _client, rx, _executor) = module();
        fs.write_file_sync("notes.txt", b"hi").unwrap();

        assert_eq!(fs.read_to_string_sync("/app/notes.txt").unwrap(), "hi");
        assert!(fs.exists_sync("notes.txt"));
        match &rx.drain()[..] {
            [FromContext::FsWrite { path, content, .. }] => {
                assert_eq!(path, "/app/notes.txt");
                assert_eq!(content, b"hi");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sync_errors() {
        let (fs, _client, rx, _executor) = module();
        assert!(fs.read_file_sync("/missing").is_err());
        assert!(fs.write_file_sync("/nope/file", b"x").is_err());
        assert!(rx.is_empty());
    }

    #[test]
    fn test_mkdir_is_recursive() {
        let (fs, _client, _rx, _executor) = module();
        fs.mkdir_sync("/a/b/c").unwrap();
        assert!(fs.stat_sync("/a/b").unwrap().kind.is_dir());
        assert_eq!(fs.readdir_sync("/a").unwrap()[0].name, "b");
    }

    #[test]
    fn test_async_read_goes_through_supervisor() {
        let (fs, client, rx, _executor) = module();
        let mut read = Box::pin(fs.read_file("data.bin"));
        assert!((&mut read).now_or_never().is_none());

        let sent = rx.drain();
        let id = match &sent[..] {
            [FromContext::FsRead { id, path, as_text }] => {
                assert_eq!(path, "/app/data.bin");
                assert!(!as_text);
                *id
            }
            other => panic!("unexpected {:?}", other),
        };

        client.settle(id, Ok(json!(protocol::encode_base64(&[1, 2, 3]))));
        assert_eq!(read.now_or_never(), Some(Ok(Buffer::from_bytes(vec![1, 2, 3]))));
    }

    #[test]
    fn test_async_error_is_remote_message() {
        let (fs, client, rx, _executor) = module();
        let mut list = Box::pin(fs.readdir("/nowhere"));
        assert!((&mut list).now_or_never().is_none());

        let id = rx.drain()[0].call_id().unwrap();
        client.settle(id, Err("Not found: /nowhere".to_string()));
        assert_eq!(list.now_or_never(), Some(Err("Not found: /nowhere".to_string())));
    }

    #[test]
    fn test_refused_sync_write_is_logged() {
        let (fs, client, rx, mut executor) = module();
        fs.write_file_sync("notes.txt", b"hi").unwrap();
        fs.mkdir_sync("/app/tmp").unwrap();
        executor.run_until_stalled();

        let ids: Vec<CallId> = rx.drain().iter().filter_map(FromContext::call_id).collect();
        assert_eq!(ids.len(), 2);
        client.settle(ids[0], Err("Read-only: /app/notes.txt".to_string()));
        client.settle(ids[1], Ok(Json::Null));
        executor.run_until_stalled();

        match &rx.drain()[..] {
            [FromContext::Log { text, level }] => {
                assert_eq!(*level, LogLevel::Error);
                assert_eq!(text, "[fs] write /app/notes.txt failed: Read-only: /app/notes.txt");
            }
            other => panic!("unexpected {:?}", other),
        }
        // The mirror keeps the local write
        assert_eq!(fs.read_to_string_sync("notes.txt").unwrap(), "hi");
    }
}
