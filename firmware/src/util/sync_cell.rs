use spin::RwLock;

/// Like Cell<T> but can be shared between a caller and the operation queue,
/// which fills it in when a deferred call completes
#[derive(Debug, Default)]
pub struct SynCell<T> {
    inner: RwLock<T>,
}

impl<T> SynCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    pub fn set(&self, value: T) {
        *self.inner.write() = value;
    }
}

impl<T: Copy> SynCell<T> {
    pub fn get(&self) -> T {
        *self.inner.read()
    }
}
