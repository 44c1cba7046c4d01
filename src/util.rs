use crate::sync::{Mutex, thread};

/// Tracks which thread owns a single-consumer resource and asserts that
/// owner-only operations are in fact performed by the owner.
///
/// The owner is bound when a worker thread starts and released when it
/// shuts down, so the same resource can be re-bound across restarts.
pub struct OwnerTag {
    owner: Mutex<Option<thread::ThreadId>>,
    label: &'static str,
}

impl OwnerTag {
    pub fn new(label: &'static str) -> Self {
        OwnerTag {
            owner: Mutex::new(None),
            label,
        }
    }

    pub fn bind(&self) {
        let mut owner = self.owner.lock().unwrap();
        assert!(owner.is_none(), "{}: owner already bound", self.label);
        *owner = Some(thread::current().id());
    }

    pub fn release(&self) {
        let mut owner = self.owner.lock().unwrap();
        assert!(owner.is_some(), "{}: owner not bound", self.label);
        *owner = None;
    }

    pub fn get(&self) -> Option<thread::ThreadId> {
        *self.owner.lock().unwrap()
    }

    /// Owner-only operations call this before touching the resource.
    pub fn assert_current(&self) {
        let owner = self.owner.lock().unwrap();
        assert!(
            *owner == Some(thread::current().id()),
            "{}: accessed from a thread that is not the owner",
            self.label,
        );
    }
}

#[test]
fn owner_tag_bind_release() {
    let tag = OwnerTag::new("test");
    assert!(tag.get().is_none());

    tag.bind();
    tag.assert_current();
    assert_eq!(tag.get(), Some(thread::current().id()));

    tag.release();
    assert!(tag.get().is_none());

    tag.bind();
    tag.assert_current();
    tag.release();
}

#[test]
#[should_panic]
fn owner_tag_wrong_thread() {
    use std::sync::Arc;

    let tag = Arc::new(OwnerTag::new("test"));
    tag.bind();

    let tag2 = Arc::clone(&tag);
    std::thread::spawn(move || {
        tag2.assert_current();
    })
    .join()
    .unwrap();
}
