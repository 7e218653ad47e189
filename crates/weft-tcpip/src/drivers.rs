use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use crate::iface::Driver;

/// In-memory driver for tests and host-side simulation: frames queued
/// through the handle appear on `rx`, transmitted frames are collected
/// for inspection.
pub struct MockDriver {
    shared: Rc<RefCell<Shared>>,
}

#[derive(Default)]
struct Shared {
    link: bool,
    rx: VecDeque<Vec<u8>>,
    tx: Vec<Vec<u8>>,
}

/// Test-side handle to a [`MockDriver`].
#[derive(Clone)]
pub struct MockHandle {
    shared: Rc<RefCell<Shared>>,
}

impl MockDriver {
    pub fn new() -> (Self, MockHandle) {
        let shared = Rc::new(RefCell::new(Shared { link: true, ..Shared::default() }));
        (Self { shared: Rc::clone(&shared) }, MockHandle { shared })
    }
}

impl MockHandle {
    pub fn set_link(&self, up: bool) {
        self.shared.borrow_mut().link = up;
    }

    /// Queues a frame for the interface to receive.
    pub fn push_rx(&self, frame: &[u8]) {
        self.shared.borrow_mut().rx.push_back(frame.to_vec());
    }

    /// Drains everything the interface transmitted so far.
    pub fn take_tx(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.shared.borrow_mut().tx)
    }
}

impl Driver for MockDriver {
    fn init(&mut self, _mac: &[u8; 6]) -> bool {
        true
    }

    fn tx(&mut self, frame: &[u8]) -> usize {
        self.shared.borrow_mut().tx.push(frame.to_vec());
        frame.len()
    }

    fn rx(&mut self, buf: &mut [u8]) -> usize {
        let mut sh = self.shared.borrow_mut();
        match sh.rx.front() {
            Some(f) if f.len() <= buf.len() => {
                let f = sh.rx.pop_front().expect("peeked");
                buf[..f.len()].copy_from_slice(&f);
                f.len()
            }
            Some(_) => {
                sh.rx.pop_front();
                0
            }
            None => 0,
        }
    }

    fn up(&mut self) -> bool {
        self.shared.borrow_mut().link
    }
}
