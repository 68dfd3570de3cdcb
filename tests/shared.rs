use bixheap::{
    lock::NoLock, CheckedOptions, DefaultOptions, InitError, NoRecorder, RegionConfig,
    SharedHeap,
};
use std::{mem::MaybeUninit, ptr::NonNull};

fn leak_pool(len: usize) -> &'static mut [MaybeUninit<u8>] {
    Box::leak(vec![MaybeUninit::<u8>::uninit(); len].into_boxed_slice())
}

const UNCONFIGURED: RegionConfig = RegionConfig { base: 0, len: 0 };

#[test]
fn explicit_init() {
    let _ = env_logger::builder().is_test(true).try_init();

    let heap: SharedHeap<NoLock> = unsafe { SharedHeap::new(UNCONFIGURED, NoRecorder) };
    heap.init(leak_pool(1024)).unwrap();
    assert_eq!(heap.init(leak_pool(1024)), Err(InitError::AlreadyInitialized));

    let ptr = heap.allocate(100).unwrap();
    assert_eq!(heap.info().unwrap().used_entries, 1);
    unsafe { heap.release(Some(ptr)) };
    assert_eq!(heap.info().unwrap().used_entries, 0);
    heap.check_integrity().unwrap();
}

#[test]
fn lazy_init_from_config() {
    let _ = env_logger::builder().is_test(true).try_init();

    let pool = leak_pool(4096);
    let config = RegionConfig {
        base: pool.as_mut_ptr() as usize,
        len: pool.len(),
    };
    let heap: SharedHeap<NoLock> = unsafe { SharedHeap::new(config, NoRecorder) };

    let free = heap.free_bytes_remaining();
    assert!(free > 4000);

    let ptr = heap.allocate_zeroed(4, 16).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
    assert!(bytes.iter().all(|&b| b == 0));
    let ptr = unsafe { heap.resize(Some(ptr), 200) }.unwrap();
    assert_eq!(heap.dump(Some(ptr), true), None);
    unsafe { heap.release(Some(ptr)) };
    assert_eq!(heap.free_bytes_remaining(), free);

    // The region has been taken over
    assert_eq!(heap.init(leak_pool(1024)), Err(InitError::AlreadyInitialized));
}

#[test]
fn unconfigured_heap_fails() {
    let heap: SharedHeap<NoLock> = unsafe { SharedHeap::new(UNCONFIGURED, NoRecorder) };
    assert_eq!(heap.allocate(8), None);
    assert_eq!(heap.free_bytes_remaining(), 0);
    assert_eq!(heap.info(), None);
    assert_eq!(heap.with(|_| ()), None);
    unsafe { heap.release(NonNull::new(8 as *mut u8)) };
}

#[test]
fn too_small_region() {
    let pool = leak_pool(16);
    let heap: SharedHeap<NoLock> = unsafe { SharedHeap::new(UNCONFIGURED, NoRecorder) };
    assert_eq!(heap.init(pool), Err(InitError::TooSmall { len: 16 }));
    assert_eq!(heap.allocate(1), None);
}

#[test]
fn checked_shared_heap() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static CORRUPTIONS: AtomicUsize = AtomicUsize::new(0);

    let _ = env_logger::builder().is_test(true).try_init();

    let heap: SharedHeap<NoLock, CheckedOptions> =
        unsafe { SharedHeap::new(UNCONFIGURED, NoRecorder) };
    heap.init(leak_pool(2048)).unwrap();
    heap.set_corruption_handler(|| {
        CORRUPTIONS.fetch_add(1, Ordering::Relaxed);
    });

    let ptr = heap.allocate(16).unwrap();
    unsafe { ptr.as_ptr().add(16).write(0) };
    assert!(heap.check_poison().is_err());
    unsafe { heap.release(Some(ptr)) };
    assert_eq!(CORRUPTIONS.load(Ordering::Relaxed), 1);
    assert_eq!(heap.info().unwrap().used_entries, 1);

    let entries = heap.with(|heap| heap.info().total_entries).unwrap();
    assert_eq!(entries, 2);
}

#[cfg(unix)]
#[test]
fn threads() {
    use bixheap::lock::PthreadMutex;

    static HEAP: SharedHeap<PthreadMutex, DefaultOptions> =
        unsafe { SharedHeap::new(UNCONFIGURED, NoRecorder) };

    let _ = env_logger::builder().is_test(true).try_init();

    HEAP.init(leak_pool(64 * 1024)).unwrap();
    let free = HEAP.free_bytes_remaining();

    let threads: Vec<_> = (0..8u8)
        .map(|t| {
            std::thread::spawn(move || {
                for i in 0..500usize {
                    let len = 1 + (i * 7 + t as usize) % 200;
                    let ptr = match HEAP.allocate(len) {
                        Some(ptr) => ptr,
                        None => continue,
                    };
                    unsafe {
                        ptr.as_ptr().write_bytes(t, len);
                        let ptr = HEAP.resize(Some(ptr), len * 2).unwrap_or(ptr);
                        let bytes = std::slice::from_raw_parts(ptr.as_ptr(), len);
                        assert!(bytes.iter().all(|&b| b == t));
                        HEAP.release(Some(ptr));
                    }
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    HEAP.check_integrity().unwrap();
    assert_eq!(HEAP.free_bytes_remaining(), free);
    assert_eq!(HEAP.info().unwrap().used_entries, 0);
}

#[cfg(feature = "critical-section")]
#[test]
fn critical_section_lock() {
    use bixheap::lock::CriticalSectionLock;

    static HEAP: SharedHeap<CriticalSectionLock> =
        unsafe { SharedHeap::new(UNCONFIGURED, NoRecorder) };

    HEAP.init(leak_pool(1024)).unwrap();
    let ptr = HEAP.allocate(32).unwrap();
    unsafe { HEAP.release(Some(ptr)) };
    HEAP.check_integrity().unwrap();
}
