use crate::clocks::Clocks;
use crate::descriptor::{Descriptor, Resource, Rights};
use crate::sched::subscription::{Event, Subscription};
use crate::sched::Scheduler;
use crate::sys::{self, Backend};
use crate::table::{DescriptorGuard, DescriptorTable};
use crate::Result;
use cap_std::ambient_authority;
use std::time::Duration;

/// Everything a host-call entry point needs: the descriptor table, the
/// clocks, and the scheduler. The entry points themselves (argument
/// decoding, guest-memory marshaling) live in the embedding VM and call
/// through this type.
pub struct WasiCtx {
    table: DescriptorTable,
    clocks: Clocks,
    sched: Scheduler,
}

impl WasiCtx {
    pub fn builder() -> WasiCtxBuilder {
        WasiCtxBuilder::new()
    }

    pub fn table(&self) -> &DescriptorTable {
        &self.table
    }

    pub fn clocks(&self) -> &Clocks {
        &self.clocks
    }

    pub fn resolve_fd(&self, fd: u32) -> Result<DescriptorGuard> {
        self.table.resolve(fd)
    }

    /// Insert a freshly opened resource; the rights passed here are the
    /// widest the descriptor will ever hold.
    pub fn insert_resource(&self, resource: Resource, rights: Rights) -> Result<u32> {
        self.table.open(Descriptor::new(resource, rights))
    }

    pub fn fd_close(&self, fd: u32) -> Result<()> {
        self.table.close(fd)
    }

    pub fn fd_renumber(&self, from: u32, to: u32) -> Result<()> {
        self.table.renumber(from, to)
    }

    pub fn poll_oneoff(&self, subs: &[Subscription]) -> Result<Vec<Event>> {
        self.sched.poll_oneoff(&self.table, &self.clocks, subs)
    }

    pub fn sched_yield(&self) {
        self.sched.sched_yield()
    }

    pub fn sleep(&self, duration: Duration) {
        self.sched.sleep(duration)
    }
}

/// Builds a [`WasiCtx`], seeding the initial descriptors and their rights —
/// the capability-issuing step. Stdio lands at fds 0/1/2 as non-owning
/// observers; preopens take the fds after that in insertion order.
pub struct WasiCtxBuilder {
    inherit_stdio: bool,
    preopens: Vec<Descriptor>,
    backend: Option<Box<dyn Backend>>,
}

impl WasiCtxBuilder {
    pub fn new() -> Self {
        Self {
            inherit_stdio: false,
            preopens: Vec::new(),
            backend: None,
        }
    }

    pub fn inherit_stdio(mut self) -> Self {
        self.inherit_stdio = true;
        self
    }

    pub fn preopened_file(mut self, file: std::fs::File, rights: Rights) -> Self {
        self.preopens.push(Descriptor::new(Resource::File(file), rights));
        self
    }

    pub fn preopened_dir(mut self, dir: std::fs::File, rights: Rights) -> Self {
        self.preopens.push(Descriptor::new(Resource::Dir(dir), rights));
        self
    }

    pub fn preopened(mut self, descriptor: Descriptor) -> Self {
        self.preopens.push(descriptor);
        self
    }

    /// Override the platform-selected readiness backend.
    pub fn backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> Result<WasiCtx> {
        let table = DescriptorTable::new();
        if self.inherit_stdio {
            table.open_at(
                0,
                Descriptor::new(Resource::FileObserver(sys::stdin()), Rights::file_base()),
            )?;
            table.open_at(
                1,
                Descriptor::new(Resource::FileObserver(sys::stdout()), Rights::file_base()),
            )?;
            table.open_at(
                2,
                Descriptor::new(Resource::FileObserver(sys::stderr()), Rights::file_base()),
            )?;
        }
        for descriptor in self.preopens {
            table.open(descriptor)?;
        }
        let sched = match self.backend {
            Some(backend) => Scheduler::with_backend(backend),
            None => Scheduler::new(),
        };
        Ok(WasiCtx {
            table,
            clocks: Clocks::new(ambient_authority()),
            sched,
        })
    }
}

impl Default for WasiCtxBuilder {
    fn default() -> Self {
        Self::new()
    }
}
