//! The PMIx daemon binary: parses configuration, starts structured logging, and runs a
//! per-node server against an in-process demo host module so the daemon is runnable
//! standalone. A real embedder (a workload manager) replaces `DemoHost` with upcalls into its
//! own job-management state.

use clap::{App, Arg};
use pmix_core::host::{Info, InfoValue, ModexCb, ModexRecord, Range, ServerModule, StatusCb};
use pmix_core::server::{Server, ServerConfig};
use pmix_util::error::{PmixError, PmixResult};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;

struct DemoHost {
    modex: RefCell<HashMap<(String, i32), Vec<Vec<u8>>>>,
    published: RefCell<HashMap<String, HashMap<String, InfoValue>>>,
}

impl DemoHost {
    fn new() -> DemoHost {
        DemoHost {
            modex: RefCell::new(HashMap::new()),
            published: RefCell::new(HashMap::new()),
        }
    }
}

impl ServerModule for DemoHost {
    fn abort(&self, status: i32, msg: &str) -> PmixResult<()> {
        eprintln!("client abort: status={} msg={}", status, msg);
        Ok(())
    }

    fn store_modex(&self, _scope: &str, record: ModexRecord) -> PmixResult<()> {
        self.modex
            .borrow_mut()
            .entry((record.namespace, record.rank))
            .or_insert_with(Vec::new)
            .push(record.blob);
        Ok(())
    }

    fn fence_nb(&self, ranges: &[Range], _barrier: bool, collect_data: bool, cb: ModexCb) -> PmixResult<()> {
        let mut data = Vec::new();
        if collect_data {
            let modex = self.modex.borrow();
            for range in ranges {
                let ranks: Vec<i32> = match &range.ranks {
                    Some(r) => r.clone(),
                    None => modex
                        .keys()
                        .filter(|(ns, _)| ns == &range.namespace)
                        .map(|(_, rank)| *rank)
                        .collect(),
                };
                for rank in ranks {
                    if let Some(blobs) = modex.get(&(range.namespace.clone(), rank)) {
                        for blob in blobs {
                            data.push(ModexRecord {
                                namespace: range.namespace.clone(),
                                rank,
                                blob: blob.clone(),
                            });
                        }
                    }
                }
            }
        }
        cb(Ok(()), data);
        Ok(())
    }

    fn get_modex_nb(&self, namespace: &str, rank: i32, cb: ModexCb) -> PmixResult<()> {
        let modex = self.modex.borrow();
        let data = modex
            .get(&(namespace.to_owned(), rank))
            .map(|blobs| {
                blobs
                    .iter()
                    .map(|blob| ModexRecord {
                        namespace: namespace.to_owned(),
                        rank,
                        blob: blob.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        cb(Ok(()), data);
        Ok(())
    }

    fn publish(&self, scope: &str, info: &[Info]) -> PmixResult<()> {
        let mut published = self.published.borrow_mut();
        let entry = published.entry(scope.to_owned()).or_insert_with(HashMap::new);
        for i in info {
            entry.insert(i.key.clone(), i.value.clone());
        }
        Ok(())
    }

    fn lookup(&self, scope: &str, keys: &[String]) -> PmixResult<(String, Vec<Info>)> {
        let published = self.published.borrow();
        let entry = published.get(scope).ok_or(PmixError::NotSupported)?;
        let mut info = Vec::with_capacity(keys.len());
        for key in keys {
            let value = entry.get(key).cloned().ok_or(PmixError::NotSupported)?;
            info.push(Info { key: key.clone(), value });
        }
        Ok((scope.to_owned(), info))
    }

    fn unpublish(&self, scope: &str, keys: &[String]) -> PmixResult<()> {
        if let Some(entry) = self.published.borrow_mut().get_mut(scope) {
            for key in keys {
                entry.remove(key);
            }
        }
        Ok(())
    }

    fn connect(&self, _ranges: &[Range], cb: StatusCb) -> PmixResult<()> {
        cb(Ok(()));
        Ok(())
    }

    fn disconnect(&self, _ranges: &[Range], cb: StatusCb) -> PmixResult<()> {
        cb(Ok(()));
        Ok(())
    }

    fn get_job_info(&self, _namespace: &str, _rank: i32) -> PmixResult<Vec<Info>> {
        Ok(Vec::new())
    }

    fn terminated(&self, namespace: &str, rank: i32) {
        eprintln!("peer terminated: {}:{}", namespace, rank);
    }
}

fn decode_hex(s: &str) -> Vec<u8> {
    (0..s.len())
        .step_by(2)
        .filter_map(|i| s.get(i..i + 2).and_then(|byte| u8::from_str_radix(byte, 16).ok()))
        .collect()
}

fn main() {
    let matches = App::new("pmix-server")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Bush Hammer Industries")
        .about("Per-node PMIx bootstrap daemon")
        .arg(
            Arg::with_name("tmpdir")
                .long("tmpdir")
                .takes_value(true)
                .help("Directory to bind the rendezvous socket in (overrides TMPDIR/TEMP/TMP)"),
        )
        .arg(
            Arg::with_name("credential")
                .long("credential")
                .takes_value(true)
                .help("Hex-encoded handshake credential clients must present"),
        )
        .arg(
            Arg::with_name("debug")
                .long("debug")
                .takes_value(true)
                .help("Overrides PMIX_DEBUG"),
        )
        .get_matches();

    let debug_level: u8 = matches
        .value_of("debug")
        .and_then(|v| v.parse().ok())
        .or_else(|| std::env::var("PMIX_DEBUG").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(0);

    let logger = pmix_util::logging::init(debug_level);

    let config = ServerConfig {
        tmpdir: matches.value_of("tmpdir").map(PathBuf::from),
        credential: matches.value_of("credential").map(decode_hex),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        max_cred_size: pmix_core::net::wire::MAX_CRED_SIZE,
    };

    let mut server = Server::new(Box::new(DemoHost::new()), config, logger.clone());
    let rendezvous = server.init().expect("failed to bind rendezvous socket");
    slog::info!(logger, "pmix-server ready"; "uri" => rendezvous.uri.as_str());

    loop {
        if let Err(err) = server.run_once(Some(1000)) {
            slog::error!(logger, "reactor error, shutting down"; "error" => err.to_string());
            break;
        }
    }

    server.finalize();
}
