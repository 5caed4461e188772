mod common;

use common::*;
use keos::{KernelError, addressing::PAGE_SIZE};
use keos_vm::{KERN_BASE, VmType, uninit::Loader};

#[test]
fn alloc_checks_its_arguments() {
    let m = Machine::new(2, 2);
    let p = m.process(1);
    let (file, _) = mem_file(&pattern(PAGE_SIZE, 0));

    p.mm.alloc_page(VmType::Anon, page(0), true).unwrap();
    assert_eq!(
        p.mm.alloc_page(VmType::Anon, page(0), false),
        Err(KernelError::FileExist)
    );
    assert_eq!(
        p.mm.alloc_page(VmType::Anon, page(1) + 8, true),
        Err(KernelError::InvalidArgument)
    );
    assert_eq!(
        p.mm.alloc_page(VmType::Anon, va(KERN_BASE), true),
        Err(KernelError::BadAddress)
    );
    assert_eq!(
        p.mm.alloc_page(VmType::Anon, va(KERN_BASE - PAGE_SIZE), true),
        Ok(())
    );
    assert_eq!(
        p.mm.alloc_page(VmType::Uninit, page(1), true),
        Err(KernelError::InvalidArgument)
    );
    // A file page needs a file.
    assert_eq!(
        p.mm.alloc_page(VmType::File, page(1), true),
        Err(KernelError::InvalidArgument)
    );
    // No more than a page can come from the file.
    for ty in [VmType::File, VmType::Anon] {
        let loader = Loader::FromFile {
            file: file.duplicate(),
            offset: 0,
            read_bytes: 2 * PAGE_SIZE,
        };
        assert_eq!(
            p.mm.alloc_page_with_initializer(ty, page(1), true, loader),
            Err(KernelError::InvalidArgument)
        );
    }
    assert!(p.mm.spt().find(page(1)).is_none());
    let loader = Loader::FromFile {
        file,
        offset: 0,
        read_bytes: PAGE_SIZE,
    };
    p.mm
        .alloc_page_with_initializer(VmType::File, page(1), true, loader)
        .unwrap();
    assert_eq!(p.mm.spt().len(), 3);
    p.write(page(1), 1).unwrap();
    p.mm.remove_page(page(1)).unwrap();
}

#[test]
fn find_rounds_down() {
    let m = Machine::new(2, 2);
    let p = m.process(1);
    p.mm.alloc_page(VmType::Anon, page(3), true).unwrap();

    let handle = p.mm.spt().find(page(3) + (PAGE_SIZE - 1)).unwrap();
    let page_va = handle.lock();
    assert_eq!(page_va.va(), page(3));
    page_va.unlock();
    assert!(p.mm.spt().find(page(4)).is_none());
    assert!(p.mm.spt().find(page(3) - 1).is_none());
}

#[test]
fn remove_page_releases_resources() {
    let m = Machine::new(1, 2);
    let p = m.process(1);
    p.mm.alloc_page(VmType::Anon, page(0), true).unwrap();
    p.mm.alloc_page(VmType::Anon, page(1), true).unwrap();
    p.write(page(0), 1).unwrap();
    p.write(page(1), 2).unwrap();
    assert_eq!(m.vm.swap().nr_used(), 1);
    assert_eq!(m.palloc.nr_free(), 0);

    // page(0) sits in a slot, page(1) in the frame.
    p.mm.remove_page(page(0)).unwrap();
    assert_eq!(m.vm.swap().nr_used(), 0);
    p.mm.remove_page(page(1) + 17).unwrap();
    assert_eq!(m.palloc.nr_free(), 1);
    assert!(m.vm.frames().is_empty());
    assert!(p.pt.is_empty());

    assert_eq!(p.mm.remove_page(page(1)), Err(KernelError::BadAddress));
    assert_eq!(p.mm.claim_page(page(1)), Err(KernelError::BadAddress));
    assert_eq!(p.read(page(1)), Err(KernelError::BadAddress));
}

#[test]
fn exit_is_idempotent() {
    let m = Machine::new(2, 2);
    let p = m.process(1);
    p.mm.alloc_page(VmType::Anon, page(0), true).unwrap();
    p.write(page(0), 1).unwrap();

    p.mm.exit();
    assert!(p.mm.spt().is_dead());
    assert!(p.mm.spt().is_empty());
    assert_eq!(m.palloc.nr_free(), 2);
    p.mm.exit();
    assert_eq!(m.palloc.nr_free(), 2);

    // Nothing can be added to a dead table.
    assert_eq!(
        p.mm.alloc_page(VmType::Anon, page(1), true),
        Err(KernelError::BadAddress)
    );
    assert!(p.mm.spt().find(page(0)).is_none());
    assert_eq!(p.read(page(0)), Err(KernelError::BadAddress));
}

#[test]
fn claim_is_a_no_op_when_resident() {
    let m = Machine::new(2, 2);
    let p = m.process(1);
    p.mm.alloc_page(VmType::Anon, page(0), true).unwrap();
    p.mm.claim_page(page(0)).unwrap();
    let pa = p.with_page(page(0), |page| page.frame().unwrap().pa());
    p.write(page(0), 9).unwrap();

    p.mm.claim_page(page(0)).unwrap();
    assert_eq!(p.with_page(page(0), |page| page.frame().unwrap().pa()), pa);
    assert_eq!(m.vm.frames().len(), 1);
    assert_eq!(p.read(page(0)).unwrap(), 9);
}

#[test]
fn processes_are_separate() {
    let m = Machine::new(4, 4);
    let a = m.process(1);
    let b = m.process(2);
    a.mm.alloc_page(VmType::Anon, page(0), true).unwrap();
    b.mm.alloc_page(VmType::Anon, page(0), true).unwrap();
    a.write(page(0), 1).unwrap();
    b.write(page(0), 2).unwrap();

    assert_eq!(a.read(page(0)).unwrap(), 1);
    assert_eq!(b.read(page(0)).unwrap(), 2);
    assert_eq!(a.with_page(page(0), |page| page.pid()), 1);
    assert_eq!(b.with_page(page(0), |page| page.pid()), 2);
    drop(a);
    assert_eq!(b.read(page(0)).unwrap(), 2);
    assert_eq!(m.vm.frames().len(), 1);
}
