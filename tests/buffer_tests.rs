use flowbox::buffers::{Buffer, BufferList, BufferType};
use flowbox::hal::{Device, DeviceRegistry, MockAccelerator};
use flowbox::memory::{CopyKind, MemoryManager, PoolConfig};
use flowbox::{FlowError, StatusCode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn cpu() -> Arc<Device> {
    DeviceRegistry::default().create_device("cpu", "0").unwrap()
}

fn mock(backend: Arc<MockAccelerator>) -> Arc<Device> {
    let manager = MemoryManager::new("mock:0", backend, &PoolConfig::default());
    Arc::new(Device::new("mock", "0", manager))
}

#[test]
fn test_build_and_write() {
    let mut buffer = Buffer::new(cpu());
    assert!(buffer.is_empty());
    assert!(buffer.data().is_none());

    buffer.build(16).unwrap();
    assert_eq!(buffer.bytes(), 16);
    assert!(buffer.is_mutable());

    buffer.mutable_data().unwrap().copy_from_slice(&[3u8; 16]);
    assert_eq!(buffer.data().unwrap(), &[3u8; 16]);
    assert!(buffer.verify().is_ok());
}

#[test]
fn test_build_without_device_faults() {
    let mut buffer = Buffer::default();
    let err = buffer.build(8).unwrap_err();
    assert_eq!(err.code(), StatusCode::Fault);
}

#[test]
fn test_build_failure_is_fault() {
    let device = mock(Arc::new(MockAccelerator::with_capacity(64)));
    let mut buffer = Buffer::new(device);

    let err = buffer.build(1024).unwrap_err();
    assert_eq!(err.code(), StatusCode::Fault);
    assert!(buffer.data().is_none());
}

#[test]
fn test_shallow_copy_shares_memory() {
    let mut buffer = Buffer::new(cpu());
    buffer.build_from_host(b"shared").unwrap();
    buffer.set("pts", 10i64);

    let mut copy = buffer.copy();
    copy.set("pts", 20i64);

    let (a, b) = (buffer.device_memory().unwrap(), copy.device_memory().unwrap());
    assert!(Arc::ptr_eq(a, b));
    assert_eq!(buffer.get::<i64>("pts"), Some(10));
    assert_eq!(copy.get::<i64>("pts"), Some(20));

    buffer.set("pts", 30i64);
    buffer.set("dts", 29i64);
    assert_eq!(copy.get::<i64>("pts"), Some(20));
    assert_eq!(copy.get::<i64>("dts"), None);
    assert_eq!(buffer.get::<i64>("pts"), Some(30));

    // shared memory cannot be written through either buffer
    assert!(copy.mutable_data().is_none());
    drop(buffer);
    assert!(copy.mutable_data().is_some());
}

#[test]
fn test_deep_copy_owns_memory() {
    let mut buffer = Buffer::new(cpu());
    buffer.build_from_host(&[1, 2, 3, 4]).unwrap();
    buffer.set("width", 2i32);
    buffer.set_buffer_type(BufferType::Image);

    let mut copy = buffer.deep_copy().unwrap();
    assert!(!Arc::ptr_eq(
        buffer.device_memory().unwrap(),
        copy.device_memory().unwrap()
    ));
    assert_eq!(copy.data().unwrap(), &[1, 2, 3, 4]);
    assert_eq!(copy.get::<i32>("width"), Some(2));
    assert_eq!(copy.buffer_type(), BufferType::Image);

    copy.mutable_data().unwrap()[0] = 100;
    assert_eq!(buffer.data().unwrap()[0], 1);
}

#[test]
fn test_copy_to_accelerator() {
    let backend = Arc::new(MockAccelerator::new());
    let device = mock(backend.clone());

    let mut buffer = Buffer::new(cpu());
    buffer.build_from_host(b"frame").unwrap();
    buffer.set("pix_fmt", "rgb".to_string());

    let moved = buffer.copy_to(&device).unwrap();
    assert_eq!(moved.device().unwrap().id(), "0");
    assert_eq!(moved.device().unwrap().device_type(), "mock");
    assert_eq!(moved.data().unwrap(), b"frame");
    assert_eq!(moved.get::<String>("pix_fmt").as_deref(), Some("rgb"));
    assert_eq!(backend.copy_log(), vec![CopyKind::ToDevice]);

    let back = moved.copy_to(&cpu()).unwrap();
    assert_eq!(back.data().unwrap(), b"frame");
}

#[test]
fn test_copy_to_failure_propagates() {
    let backend = Arc::new(MockAccelerator::new());
    let device = mock(backend.clone());
    backend.set_fail_copies(true);

    let mut buffer = Buffer::new(cpu());
    buffer.build_from_host(b"frame").unwrap();

    let err = buffer.copy_to(&device).unwrap_err();
    assert_eq!(err.code(), StatusCode::Fault);
}

#[test]
fn test_set_error_drops_payload() {
    let mut buffer = Buffer::new(cpu());
    buffer.build(32).unwrap();

    buffer.set_error(FlowError::invalid("decode failed"));
    assert!(buffer.has_error());
    assert_eq!(buffer.error().unwrap().code(), StatusCode::Invalid);
    assert!(buffer.data().is_none());
    assert_eq!(buffer.bytes(), 0);
}

#[test]
fn test_build_from_owned_releases_once() {
    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();

    let mut buffer = Buffer::new(cpu());
    buffer
        .build_from_owned(vec![5u8; 64], move |bytes: Vec<u8>| {
            assert_eq!(bytes.len(), 64);
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(buffer.bytes(), 64);

    let copy = buffer.copy();
    drop(buffer);
    assert_eq!(released.load(Ordering::SeqCst), 0);
    drop(copy);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_frozen_buffer_is_read_only() {
    let mut buffer = Buffer::new(cpu());
    buffer.build(4).unwrap();
    buffer.set_mutable(false);

    assert!(!buffer.is_mutable());
    assert!(buffer.mutable_data().is_none());
    assert_eq!(buffer.data().unwrap().len(), 4);
}

#[test]
fn test_copy_meta_overwrite() {
    let mut a = Buffer::new(cpu());
    a.set("width", 10i32);
    a.set("height", 20i32);

    let mut b = Buffer::new(cpu());
    b.set("width", 1i32);

    b.copy_meta(&a, false);
    assert_eq!(b.get::<i32>("width"), Some(1));
    assert_eq!(b.get::<i32>("height"), Some(20));

    b.copy_meta(&a, true);
    assert_eq!(b.get::<i32>("width"), Some(10));
    assert_eq!(b.get_or("missing", 7i32), 7);
}

#[test]
fn test_meta_type_mismatch_is_none() {
    let mut buffer = Buffer::new(cpu());
    buffer.set("width", 10i32);
    assert_eq!(buffer.get::<i64>("width"), None);
    assert_eq!(buffer.get::<i32>("width"), Some(10));
}

#[test]
fn test_list_build_sizes() {
    let mut list = BufferList::new(cpu());
    list.build(&[100, 200]).unwrap();

    assert_eq!(list.len(), 2);
    assert_eq!(list[0].bytes(), 100);
    assert_eq!(list[1].bytes(), 200);
    assert_eq!(list.bytes(), 300);
    assert!(list.mutable_buffer_data(1).is_some());
}

#[test]
fn test_list_build_is_all_or_nothing() {
    let device = mock(Arc::new(MockAccelerator::with_capacity(1024)));
    let mut list = BufferList::new(device);
    list.build(&[8]).unwrap();

    let err = list.build(&[256, 256, 2048]).unwrap_err();
    assert_eq!(err.code(), StatusCode::Fault);
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].bytes(), 8);
}

#[test]
fn test_list_build_from_host() {
    let mut list = BufferList::new(cpu());
    list.build_from_host(&[2, 3], &[1, 2, 3, 4, 5]).unwrap();

    assert_eq!(list.const_buffer_data(0), Some(&[1u8, 2][..]));
    assert_eq!(list.const_buffer_data(1), Some(&[3u8, 4, 5][..]));

    let err = list.build_from_host(&[2, 2], &[1, 2, 3]).unwrap_err();
    assert_eq!(err.code(), StatusCode::Invalid);
    assert_eq!(list.len(), 2);
}

#[test]
fn test_list_set_meta_and_iterate() {
    let mut list = BufferList::new(cpu());
    list.build(&[1, 1, 1]).unwrap();
    list.set_meta("channel", 3i32);

    let channels: Vec<_> = (&list).into_iter().map(|b| b.get::<i32>("channel")).collect();
    assert_eq!(channels, vec![Some(3); 3]);
    assert!(list.at(3).is_none());

    list.clear();
    assert!(list.is_empty());
}
