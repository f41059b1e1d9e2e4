//! In-process stand-in for a replica set member: accepts connections and
//! answers `isMaster` / `replSetGetStatus` from a configurable view.

use bson::{doc, Bson, Document};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

use portico_common::wire;

struct View {
    is_master: Document,
    // the literal reply sent for replSetGetStatus; None means "standalone"
    status: Option<Document>,
}

pub struct FakeMember {
    addr: String,
    accepts: Arc<AtomicU64>,
    view: Arc<Mutex<View>>,
}

impl FakeMember {
    /// A standalone node: `isMaster` succeeds without replica set fields and
    /// `replSetGetStatus` is rejected.
    pub async fn standalone() -> Self {
        let member = Self::bind().await;
        {
            let mut view = member.view.lock().unwrap();
            view.is_master = doc! { "ismaster": true, "ok": 1.0 };
            view.status = None;
        }
        member
    }

    /// A single-member replica set with this node as primary.
    pub async fn replica(set_name: &str) -> Self {
        let member = Self::bind().await;
        let addr = member.addr.clone();
        member.set_view(set_name, &[&addr], &[(&addr, "PRIMARY")]);
        member
    }

    /// A replica member that rejects `replSetGetStatus` as unauthorized.
    pub async fn replica_requiring_auth(set_name: &str) -> Self {
        let member = Self::replica(set_name).await;
        {
            let mut view = member.view.lock().unwrap();
            view.status = Some(doc! {
                "ok": 0.0,
                "code": 13,
                "errmsg": "not authorized on admin to execute command",
            });
        }
        member
    }

    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepts = Arc::new(AtomicU64::new(0));
        let view = Arc::new(Mutex::new(View {
            is_master: doc! { "ismaster": true, "ok": 1.0 },
            status: None,
        }));

        {
            let accepts = accepts.clone();
            let view = view.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(_) => return,
                    };
                    accepts.fetch_add(1, Ordering::SeqCst);
                    let view = view.clone();
                    tokio::spawn(serve_connection(stream, view));
                }
            });
        }

        Self {
            addr,
            accepts,
            view,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn count_accepts(&self) -> u64 {
        self.accepts.load(Ordering::SeqCst)
    }

    /// Replaces the topology this member reports.
    pub fn set_view(&self, set_name: &str, hosts: &[&str], members: &[(&str, &str)]) {
        let member_docs: Vec<Bson> = members
            .iter()
            .enumerate()
            .map(|(id, (name, state))| {
                Bson::Document(doc! {
                    "_id": id as i32,
                    "name": *name,
                    "stateStr": *state,
                    "health": 1.0,
                })
            })
            .collect();
        let host_list: Vec<Bson> = hosts.iter().map(|h| Bson::String(h.to_string())).collect();

        let mut view = self.view.lock().unwrap();
        view.is_master = doc! {
            "ismaster": true,
            "setName": set_name,
            "hosts": host_list,
            "primary": hosts.first().cloned().unwrap_or(""),
            "ok": 1.0,
        };
        view.status = Some(doc! {
            "set": set_name,
            "members": member_docs,
            "ok": 1.0,
        });
    }
}

async fn serve_connection(mut stream: tokio::net::TcpStream, view: Arc<Mutex<View>>) {
    loop {
        let (header, command) = match wire::read_message(&mut stream).await {
            Ok(message) => message,
            Err(_) => return,
        };
        let reply = {
            let view = view.lock().unwrap();
            if command.contains_key("isMaster") {
                view.is_master.clone()
            } else if command.contains_key("replSetGetStatus") {
                view.status.clone().unwrap_or(
                    doc! { "ok": 0.0, "code": 76, "errmsg": "not running with --replSet" },
                )
            } else {
                doc! { "ok": 0.0, "code": 59, "errmsg": "no such command" }
            }
        };
        if wire::write_message(&mut stream, 1, header.request_id, &reply)
            .await
            .is_err()
        {
            return;
        }
    }
}
