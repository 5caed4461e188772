mod common;

use common::*;
use keos::{KernelError, addressing::PAGE_SIZE};
use keos_vm::{VmType, page::PageState, uninit::Loader};

fn frame_of(p: &Process, n: usize) -> Option<keos::addressing::Pa> {
    p.with_page(page(n), |page| page.frame().map(|frame| frame.pa()))
}

#[test]
fn anonymous_memory_is_private() {
    let m = Machine::new(4, 4);
    let parent = m.process(1);
    parent.mm.alloc_page(VmType::Anon, page(0), true).unwrap();
    parent.fill(page(0), 0x10).unwrap();

    let child = parent.fork(2).unwrap();
    assert_eq!(child.mm.pid(), 2);
    assert!(child.is_resident(page(0)));
    assert_ne!(frame_of(&parent, 0), frame_of(&child, 0));
    assert_eq!(child.read_bytes(page(0), PAGE_SIZE).unwrap(), vec![0x10; PAGE_SIZE]);

    child.write(page(0) + 5, 0x20).unwrap();
    parent.write(page(0) + 6, 0x30).unwrap();
    assert_eq!(parent.read(page(0) + 5).unwrap(), 0x10);
    assert_eq!(child.read(page(0) + 6).unwrap(), 0x10);
    assert_eq!(m.vm.frames().len(), 2);
}

#[test]
fn untouched_pages_stay_untouched() {
    let m = Machine::new(4, 4);
    let parent = m.process(1);
    let contents = pattern(PAGE_SIZE, 8);
    let (file, _) = mem_file(&contents);
    parent.mm.alloc_page(VmType::Anon, page(0), true).unwrap();
    parent
        .mm
        .alloc_page_with_initializer(
            VmType::Anon,
            page(1),
            false,
            Loader::FromFile {
                file,
                offset: 0,
                read_bytes: PAGE_SIZE,
            },
        )
        .unwrap();

    let child = parent.fork(2).unwrap();
    assert!(m.vm.frames().is_empty());
    for p in [&parent, &child] {
        for n in 0..2 {
            assert!(p.with_page(page(n), |page| {
                matches!(page.state(), PageState::Uninit(u) if u.target() == VmType::Anon)
            }));
        }
        assert!(!p.with_page(page(1), |page| page.writable()));
    }

    // Each copy loads on its own.
    assert_eq!(child.read(page(1) + 100).unwrap(), contents[100]);
    assert!(!parent.is_resident(page(1)));
    assert_eq!(parent.read(page(1) + 100).unwrap(), contents[100]);
}

#[test]
fn swapped_out_page_is_copied() {
    let m = Machine::new(1, 8);
    let parent = m.process(1);
    parent.mm.alloc_page(VmType::Anon, page(0), true).unwrap();
    parent.mm.alloc_page(VmType::Anon, page(1), true).unwrap();
    parent.write(page(0), 5).unwrap();
    parent.write(page(1), 6).unwrap();
    assert!(!parent.is_resident(page(0)));

    let child = parent.fork(2).unwrap();
    // The parent keeps its slot.
    assert!(parent.with_page(page(0), |page| {
        matches!(page.state(), PageState::Anon(anon) if anon.slot().is_some())
    }));
    assert_eq!(m.vm.frames().len(), 1);

    assert_eq!(child.read(page(0)).unwrap(), 5);
    assert_eq!(child.read(page(1)).unwrap(), 6);
    child.write(page(0), 50).unwrap();
    assert_eq!(parent.read(page(0)).unwrap(), 5);
    assert_eq!(parent.read(page(1)).unwrap(), 6);
    assert_eq!(child.read(page(0)).unwrap(), 50);
}

#[test]
fn mapped_file_is_flushed_and_reread() {
    let m = Machine::new(4, 4);
    let parent = m.process(1);
    let contents = pattern(PAGE_SIZE, 3);
    let (file, inner) = mem_file(&contents);
    let addr = parent
        .mm
        .do_mmap(page(0), PAGE_SIZE, true, &file, 0)
        .unwrap();
    parent.write(addr + 3, 0x33).unwrap();
    assert_eq!(inner.contents()[3], contents[3]);

    let child = parent.fork(2).unwrap();
    assert_eq!(inner.contents()[3], 0x33);
    assert!(child.with_page(addr, |page| {
        matches!(page.state(), PageState::Uninit(u) if u.target() == VmType::File)
    }));
    let regions = child.mm.mmaps();
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].start(), addr);

    assert_eq!(child.read(addr + 3).unwrap(), 0x33);
    child.write(addr + 3, 0x44).unwrap();
    child.mm.do_munmap(addr).unwrap();
    assert_eq!(inner.contents()[3], 0x44);
    assert!(child.mm.mmaps().is_empty());

    // The parent was flushed clean and has not written since.
    assert_eq!(parent.read(addr + 3).unwrap(), 0x33);
    parent.mm.do_munmap(addr).unwrap();
    assert_eq!(inner.contents()[3], 0x44);
}

#[test]
fn child_outlives_parent() {
    let m = Machine::new(4, 4);
    let parent = m.process(1);
    for n in 0..3 {
        parent.mm.alloc_page(VmType::Anon, page(n), true).unwrap();
        parent.write(page(n), n as u8 + 1).unwrap();
    }
    let child = parent.fork(2).unwrap();
    assert_eq!(child.mm.spt().len(), 3);

    drop(parent);
    for n in 0..3 {
        assert_eq!(child.read(page(n)).unwrap(), n as u8 + 1);
    }
    assert_eq!(m.vm.frames().len(), 3);
    drop(child);
    assert!(m.vm.frames().is_empty());
    assert_eq!(m.palloc.nr_free(), 4);
    assert_eq!(m.vm.swap().nr_used(), 0);
}

#[test]
fn fork_without_memory_fails() {
    let m = Machine::new(1, 0);
    let parent = m.process(1);
    parent.mm.alloc_page(VmType::Anon, page(0), true).unwrap();
    parent.write(page(0), 1).unwrap();

    assert!(matches!(parent.fork(2), Err(KernelError::NoSpace)));
    // The parent is intact.
    assert!(parent.is_resident(page(0)));
    assert_eq!(parent.read(page(0)).unwrap(), 1);
    assert_eq!(m.vm.frames().len(), 1);
}
