pub use std::sync::atomic::Ordering;

#[cfg(not(loom))] pub use std::{
    sync::{
        Arc, Mutex, Condvar,
        atomic::{AtomicU32, AtomicU64, AtomicUsize, AtomicBool},
    },
    thread,
};


#[cfg(loom)] pub use loom::{
    sync::{
        Arc, Mutex, Condvar,
        atomic::{AtomicU32, AtomicU64, AtomicUsize, AtomicBool},
    },
    thread
};
