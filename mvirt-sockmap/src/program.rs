//! Redirect program loading and attachment.
//!
//! The redirect object contains two `sk_skb` programs (a stream parser and a
//! stream verdict) and the two table maps. The programs are compiled
//! separately in mvirt-sockmap-programs and loaded from a file.

use crate::error::{AttachError, LoadError, Result, SockmapError};
use crate::index::Capacity;
use crate::table::{DescriptorTable, SOCK_INDEX, SOCKMAP, index_entries};
use aya::maps::sock::SockMapFd;
use aya::programs::SkSkb;
use aya::programs::sk_skb::SkSkbLinkId;
use aya::{Bpf, BpfError, BpfLoader};
use aya_log::BpfLogger;
use std::path::Path;
use tracing::{info, warn};

/// Program names (must match mvirt-sockmap-programs)
pub const PARSER: &str = "sockmap_parser";
pub const VERDICT: &str = "sockmap_verdict";

/// Default install path of the compiled redirect object.
pub const DEFAULT_PROGRAM_PATH: &str = "/usr/lib/mvirt/ebpf/sockmap-redirect";

struct Links {
    parser: SkSkbLinkId,
    verdict: SkSkbLinkId,
}

/// Loaded redirect programs.
pub struct RedirectProgram {
    bpf: Bpf,
    links: Option<Links>,
    _logger: Option<BpfLogger>,
}

impl RedirectProgram {
    /// Open the redirect object at `path` and load both programs into the
    /// kernel. The table maps are created with `capacity` entries.
    pub fn load(path: &Path, capacity: Capacity) -> Result<Self> {
        let mut bpf = BpfLoader::new()
            .set_max_entries(SOCKMAP, capacity.get())
            .set_max_entries(SOCK_INDEX, index_entries(capacity))
            .load_file(path)
            .map_err(|e| match e {
                BpfError::MapError(source) => SockmapError::ResourceExhausted {
                    context: format!("creating table maps from {}", path.display()),
                    source: Some(source),
                },
                source => LoadError::Object {
                    path: path.display().to_string(),
                    source,
                }
                .into(),
            })?;

        for name in [PARSER, VERDICT] {
            let prog: &mut SkSkb = bpf
                .program_mut(name)
                .ok_or(LoadError::ProgramNotFound(name))?
                .try_into()
                .map_err(|source| LoadError::Program { name, source })?;
            prog.load()
                .map_err(|source| LoadError::Program { name, source })?;
        }

        // aya-log drains the in-kernel log buffer from a tokio task.
        let logger = if tokio::runtime::Handle::try_current().is_ok() {
            match BpfLogger::init(&mut bpf) {
                Ok(logger) => Some(logger),
                Err(e) => {
                    warn!(error = %e, "eBPF logging unavailable");
                    None
                }
            }
        } else {
            None
        };

        info!(path = %path.display(), capacity = %capacity, "Redirect program loaded");

        Ok(Self {
            bpf,
            links: None,
            _logger: logger,
        })
    }

    /// The loaded object, used to hand the table maps to the descriptor table.
    pub fn object_mut(&mut self) -> &mut Bpf {
        &mut self.bpf
    }

    /// Attach parser and verdict to the table's sockmap.
    pub fn attach(&mut self, table: &DescriptorTable) -> Result<()> {
        if self.links.is_some() {
            return Err(AttachError::AlreadyAttached.into());
        }

        let map_fd = table
            .sockets()
            .fd()
            .try_clone()
            .map_err(AttachError::MapFd)?;

        let parser = attach_one(&mut self.bpf, PARSER, &map_fd)?;
        let verdict = match attach_one(&mut self.bpf, VERDICT, &map_fd) {
            Ok(link) => link,
            Err(e) => {
                detach_one(&mut self.bpf, PARSER, parser);
                return Err(e);
            }
        };

        self.links = Some(Links { parser, verdict });
        info!("Redirect program attached");
        Ok(())
    }

    /// Detach both programs from the table. No-op if not attached.
    pub fn detach(&mut self) {
        let Some(links) = self.links.take() else {
            return;
        };
        detach_one(&mut self.bpf, VERDICT, links.verdict);
        detach_one(&mut self.bpf, PARSER, links.parser);
        info!("Redirect program detached");
    }

    /// Unload both programs and release the object. Detaches first if needed.
    pub fn unload(mut self) -> Result<()> {
        self.detach();

        let mut first_err = None;
        for name in [VERDICT, PARSER] {
            let result = match self.bpf.program_mut(name) {
                Some(prog) => <&mut SkSkb>::try_from(prog).and_then(|prog| prog.unload()),
                None => Ok(()),
            };
            if let Err(source) = result {
                warn!(program = name, error = %source, "Failed to unload program");
                first_err.get_or_insert(LoadError::Program { name, source });
            }
        }

        drop(self.bpf);
        info!("Redirect program unloaded");

        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

fn attach_one(bpf: &mut Bpf, name: &'static str, map_fd: &SockMapFd) -> Result<SkSkbLinkId> {
    let prog: &mut SkSkb = bpf
        .program_mut(name)
        .ok_or(AttachError::NotLoaded)?
        .try_into()
        .map_err(|source| AttachError::Program { name, source })?;
    let link = prog
        .attach(map_fd)
        .map_err(|source| AttachError::Program { name, source })?;
    Ok(link)
}

fn detach_one(bpf: &mut Bpf, name: &'static str, link: SkSkbLinkId) {
    let result = match bpf.program_mut(name) {
        Some(prog) => <&mut SkSkb>::try_from(prog).and_then(|prog| prog.detach(link)),
        None => return,
    };
    if let Err(e) = result {
        warn!(program = name, error = %e, "Failed to detach program");
    }
}
