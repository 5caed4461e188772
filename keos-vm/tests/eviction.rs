mod common;

use common::*;
use keos::{KernelError, addressing::PAGE_SIZE};
use keos_vm::{VmType, uninit::Loader};
use proptest::prelude::*;
use std::collections::BTreeMap;

#[test]
fn second_chance_order() {
    let m = Machine::new(2, 8);
    let p = m.process(1);
    let [a, b, c, d] = [page(0), page(1), page(2), page(3)];
    for va in [a, b, c, d] {
        p.mm.alloc_page(VmType::Anon, va, true).unwrap();
    }

    p.mm.claim_page(a).unwrap();
    p.mm.claim_page(b).unwrap();
    assert_eq!(m.vm.frames().len(), 2);

    // `a` is referenced, so `b` goes first.
    p.read(a).unwrap();
    p.mm.claim_page(c).unwrap();
    assert!(p.is_resident(a));
    assert!(!p.is_resident(b));
    assert!(p.is_resident(c));

    // `a` used its second chance.
    p.mm.claim_page(d).unwrap();
    assert!(!p.is_resident(a));
    assert!(p.is_resident(c));
    assert!(p.is_resident(d));
    assert_eq!(m.vm.frames().len(), 2);
}

#[test]
fn scan_follows_registration_order() {
    let m = Machine::new(4, 8);
    let p = m.process(1);
    let [a, b, c, d, e, f] = [page(0), page(1), page(2), page(3), page(4), page(5)];
    for va in [a, b, c, d, e, f] {
        p.mm.alloc_page(VmType::Anon, va, true).unwrap();
    }
    for va in [a, b, c, d] {
        p.mm.claim_page(va).unwrap();
    }

    // Clears `a`, evicts `b`. The ring is now a, c, d, e with the hand on c.
    p.read(a).unwrap();
    p.mm.claim_page(e).unwrap();
    assert!(!p.is_resident(b));

    // `c` and `d` get their second chance; `e` comes before `a` wraps around.
    p.read(c).unwrap();
    p.read(d).unwrap();
    p.mm.claim_page(f).unwrap();
    assert!(!p.is_resident(e));
    for va in [a, c, d, f] {
        assert!(p.is_resident(va));
    }
}

#[test]
fn evicted_page_is_unmapped() {
    let m = Machine::new(1, 2);
    let p = m.process(1);
    p.mm.alloc_page(VmType::Anon, page(0), true).unwrap();
    p.mm.alloc_page(VmType::Anon, page(1), true).unwrap();

    p.write(page(0), 7).unwrap();
    let pa = p.with_page(page(0), |page| page.frame().unwrap().pa());
    assert!(m.vm.frames().contains(pa));

    p.write(page(1), 8).unwrap();
    assert!(p.pt.translate(page(0), false).is_err());
    // The frame is reused, zeroed, by the new page.
    assert_eq!(p.with_page(page(1), |page| page.frame().unwrap().pa()), pa);
    assert_eq!(p.read(page(1) + 1).unwrap(), 0);
    assert_eq!(p.read(page(0)).unwrap(), 7);
}

#[test]
fn contents_survive_memory_pressure() {
    let m = Machine::new(3, 16);
    let p = m.process(1);
    for n in 0..10 {
        p.mm.alloc_page(VmType::Anon, page(n), true).unwrap();
        p.write_bytes(page(n), &pattern(64, n as u8)).unwrap();
        p.write(page(n) + (PAGE_SIZE - 1), n as u8).unwrap();
    }
    assert_eq!(m.vm.frames().len(), 3);
    for n in (0..10).rev() {
        assert_eq!(p.read_bytes(page(n), 64).unwrap(), pattern(64, n as u8));
        assert_eq!(p.read(page(n) + (PAGE_SIZE - 1)).unwrap(), n as u8);
    }
    // Every non-resident page holds exactly one slot.
    assert_eq!(m.vm.swap().nr_used(), 10 - 3);
}

#[test]
fn dirty_file_page_is_written_back() {
    let m = Machine::new(1, 0);
    let p = m.process(1);
    let contents = pattern(2 * PAGE_SIZE, 3);
    let (file, inner) = mem_file(&contents);
    let addr = p.mm.do_mmap(page(0), 2 * PAGE_SIZE, true, &file, 0).unwrap();

    p.write(addr + 10, 0xEE).unwrap();
    assert_eq!(inner.contents()[10], contents[10]);

    // No swap space: the evicted file page goes back to its file.
    p.read(addr + PAGE_SIZE).unwrap();
    assert!(!p.is_resident(addr));
    assert_eq!(inner.contents()[10], 0xEE);
    assert_eq!(inner.contents().len(), contents.len());
    assert!(m.swap_writes().is_empty());

    assert_eq!(p.read(addr + 10).unwrap(), 0xEE);
}

#[test]
fn clean_file_page_is_dropped() {
    let m = Machine::new(1, 1);
    let p = m.process(1);
    let contents = pattern(2 * PAGE_SIZE, 9);
    let (file, inner) = mem_file(&contents);
    let addr = p.mm.do_mmap(page(0), 2 * PAGE_SIZE, false, &file, 0).unwrap();

    assert_eq!(p.read(addr).unwrap(), contents[0]);
    // Someone else changes the file behind the mapping.
    let mut other = file.duplicate();
    other.seek(0);
    other.write(&[0x55]).unwrap();

    p.read(addr + PAGE_SIZE).unwrap();
    assert!(!p.is_resident(addr));
    assert_eq!(inner.contents()[0], 0x55);
    assert_eq!(m.vm.swap().nr_used(), 0);
    // The next fault reads the file again.
    assert_eq!(p.read(addr).unwrap(), 0x55);
}

#[test]
fn no_memory_at_all() {
    let m = Machine::new(0, 4);
    let p = m.process(1);
    p.mm.alloc_page(VmType::Anon, page(0), true).unwrap();
    assert_eq!(p.mm.claim_page(page(0)), Err(KernelError::NoMemory));
    assert_eq!(p.write(page(0), 1), Err(KernelError::NoMemory));
    assert!(!p.is_resident(page(0)));
}

#[test]
fn failed_load_releases_frame() {
    let m = Machine::new(2, 4);
    let p = m.process(1);
    let (file, _) = mem_file(&[1; 100]);
    let loader = Loader::FromFile {
        file,
        offset: 0,
        read_bytes: PAGE_SIZE,
    };
    p.mm
        .alloc_page_with_initializer(VmType::Anon, page(0), true, loader)
        .unwrap();
    assert_eq!(p.read(page(0)), Err(KernelError::IOError));
    assert_eq!(m.palloc.nr_free(), 2);
    assert!(m.vm.frames().is_empty());
    assert!(p.pt.is_empty());
}

#[test]
fn exit_releases_everything() {
    let m = Machine::new(2, 8);
    let p = m.process(1);
    for n in 0..6 {
        p.mm.alloc_page(VmType::Anon, page(n), true).unwrap();
        p.write(page(n), 1).unwrap();
    }
    assert_eq!(m.vm.swap().nr_used(), 4);
    drop(p);
    assert_eq!(m.vm.swap().nr_used(), 0);
    assert!(m.vm.frames().is_empty());
    assert_eq!(m.palloc.nr_free(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn random_accesses_match_memory(
        ops in prop::collection::vec((0..6usize, 0..PAGE_SIZE, any::<u8>(), any::<bool>()), 1..120)
    ) {
        let m = Machine::new(2, 8);
        let p = m.process(1);
        for n in 0..6 {
            p.mm.alloc_page(VmType::Anon, page(n), true).unwrap();
        }
        let mut model = BTreeMap::new();
        for (n, ofs, byte, is_write) in ops {
            let va = page(n) + ofs;
            if is_write {
                p.write(va, byte).unwrap();
                model.insert((n, ofs), byte);
            } else {
                let expected = model.get(&(n, ofs)).copied().unwrap_or(0);
                prop_assert_eq!(p.read(va).unwrap(), expected);
            }
            prop_assert!(m.vm.frames().len() <= 2);
        }
    }
}
