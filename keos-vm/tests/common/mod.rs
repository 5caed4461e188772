//! A small machine for exercising the virtual memory subsystem: a pool of
//! physical frames, a RAM-backed swap disk whose sector accesses are recorded,
//! and user processes whose loads and stores go through a software MMU. A
//! store or load that misses raises a page fault, exactly as the trap handler
//! would, and is retried once the fault is resolved.
#![allow(dead_code)]

use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Pa, Va},
    fs::{Disk, File, MemFile, RamDisk, RegularFile, SECTOR_SIZE, Sector},
    mm::{
        PhysicalAllocator,
        page_table::{PageTableMappingError, SoftPageTable},
    },
    sync::SpinLock,
    task::{PFErrorCode, Pid},
};
use keos_vm::{MmStruct, Page, PageFaultReason, Vm, VmConfig, anon::SECTORS_PER_PAGE};
use std::sync::Arc;

pub fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

/// A user address far from the stack and the kernel.
pub const BASE: usize = 0x1000_0000;

pub fn page(n: usize) -> Va {
    va(BASE + n * PAGE_SIZE)
}

pub struct Machine {
    pub palloc: Arc<PhysicalAllocator>,
    pub vm: Arc<Vm>,
    /// Every sector access of the swap disk, as `(sector, is_write)`.
    pub swap_log: Arc<SpinLock<Vec<(Sector, bool)>>>,
}

impl Machine {
    pub fn new(nr_frames: usize, nr_slots: usize) -> Self {
        Self::with_config(VmConfig::default(), nr_frames, nr_slots)
    }

    pub fn with_config(config: VmConfig, nr_frames: usize, nr_slots: usize) -> Self {
        let palloc = PhysicalAllocator::new(nr_frames);
        let swap_log = Arc::new(SpinLock::new(Vec::new()));
        let log = swap_log.clone();
        let disk = Disk::new(Arc::new(RamDisk::new(nr_slots * SECTORS_PER_PAGE))).hook(Arc::new(
            move |sector: Sector, _: &[u8; SECTOR_SIZE], is_write: bool| {
                let mut log = log.lock();
                log.push((sector, is_write));
                log.unlock();
                Ok::<(), KernelError>(())
            },
        ));
        let vm = Vm::new(config, palloc.clone(), disk);
        Self {
            palloc,
            vm,
            swap_log,
        }
    }

    pub fn process(&self, pid: Pid) -> Process {
        let pt = Arc::new(SoftPageTable::new());
        Process {
            mm: MmStruct::new(self.vm.clone(), pid, pt.clone()),
            pt,
            palloc: self.palloc.clone(),
        }
    }

    pub fn swap_writes(&self) -> Vec<usize> {
        let log = self.swap_log.lock();
        let writes = log
            .iter()
            .filter(|(_, is_write)| *is_write)
            .map(|(sector, _)| sector.into_usize())
            .collect();
        log.unlock();
        writes
    }
}

pub struct Process {
    pub mm: MmStruct,
    pub pt: Arc<SoftPageTable>,
    pub palloc: Arc<PhysicalAllocator>,
}

impl Process {
    /// Translates a user access to `va`, faulting the page in if needed.
    pub fn access(&self, va: Va, is_write: bool) -> Result<Pa, KernelError> {
        let write = if is_write {
            PFErrorCode::WRITE_ACCESS
        } else {
            PFErrorCode::empty()
        };
        loop {
            let ec = match self.pt.translate(va, is_write) {
                Ok(pa) => return Ok(pa),
                Err(PageTableMappingError::InvalidPermission) => {
                    PFErrorCode::PRESENT | PFErrorCode::USER | write
                }
                Err(_) => PFErrorCode::USER | write,
            };
            self.mm
                .handle_page_fault(&PageFaultReason::new(ec, va))?;
        }
    }

    pub fn read(&self, va: Va) -> Result<u8, KernelError> {
        let pa = self.access(va, false)?;
        let page = unsafe { self.palloc.page_ref(pa.page_down()) }.unwrap();
        Ok(page.inner()[pa.offset()])
    }

    pub fn write(&self, va: Va, byte: u8) -> Result<(), KernelError> {
        let pa = self.access(va, true)?;
        let mut page = unsafe { self.palloc.page_ref(pa.page_down()) }.unwrap();
        page.inner_mut()[pa.offset()] = byte;
        Ok(())
    }

    pub fn read_bytes(&self, va: Va, len: usize) -> Result<Vec<u8>, KernelError> {
        (0..len).map(|i| self.read(va + i)).collect()
    }

    pub fn write_bytes(&self, va: Va, bytes: &[u8]) -> Result<(), KernelError> {
        bytes
            .iter()
            .enumerate()
            .try_for_each(|(i, b)| self.write(va + i, *b))
    }

    /// Fills the page at `va` with `byte`.
    pub fn fill(&self, va: Va, byte: u8) -> Result<(), KernelError> {
        self.write_bytes(va, &[byte; PAGE_SIZE])
    }

    /// Runs `f` on the page at `va`.
    pub fn with_page<R>(&self, va: Va, f: impl FnOnce(&Page) -> R) -> R {
        let handle = self.mm.spt().find(va).expect("no page");
        let page = handle.lock();
        let r = f(&page);
        page.unlock();
        r
    }

    pub fn is_resident(&self, va: Va) -> bool {
        self.with_page(va, |page| page.is_resident())
    }

    /// Forks the process into `pid`, with a page table of its own.
    pub fn fork(&self, pid: Pid) -> Result<Process, KernelError> {
        let pt = Arc::new(SoftPageTable::new());
        Ok(Process {
            mm: self.mm.fork(pid, pt.clone())?,
            pt,
            palloc: self.palloc.clone(),
        })
    }
}

/// An open file over `contents`, along with the file itself to inspect it.
pub fn mem_file(contents: &[u8]) -> (File, Arc<MemFile>) {
    let inner = Arc::new(MemFile::new(contents));
    (File::open(RegularFile(inner.clone())), inner)
}

/// `len` bytes of a recognizable pattern.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
