//! Reference tensor host backed by `CachingAllocator`
//!
//! Implements the reporter's capability traits for a minimal tensor
//! runtime: storages own allocator blocks, tensors are shaped views over a
//! shared storage, and the registry enumerates every live tensor.

use crate::{BufferId, Composite, LiveObjects, Node, TensorLike};
use memlab_env::{Block, CachingAllocator, DeviceError, DeviceId};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// Element type of a tensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DType {
    F16,
    F32,
    F64,
    I64,
}

impl DType {
    pub fn size(self) -> u64 {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }
}

/// A device buffer. Freed back to the allocator on drop.
pub struct Storage {
    id: BufferId,
    bytes: u64,
    device: DeviceId,
    block: Option<Block>,
    allocator: Rc<CachingAllocator>,
}

impl Storage {
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Requested size; the allocator may charge more.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.allocator.free(block);
        }
    }
}

/// A shaped view over a storage.
pub struct Tensor {
    storage: Rc<Storage>,
    shape: Vec<usize>,
    dtype: DType,
    grad: RefCell<Option<Rc<Tensor>>>,
}

impl Tensor {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.storage, &other.storage)
    }

    pub fn set_grad(&self, grad: Option<Rc<Tensor>>) {
        *self.grad.borrow_mut() = grad;
    }

    pub fn grad_tensor(&self) -> Option<Rc<Tensor>> {
        self.grad.borrow().clone()
    }
}

impl TensorLike for Tensor {
    fn buffer_id(&self) -> Option<BufferId> {
        Some(self.storage.id)
    }

    fn byte_size(&self) -> u64 {
        self.storage.bytes
    }

    fn device(&self) -> DeviceId {
        self.storage.device
    }

    fn shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn grad(&self) -> Option<Rc<dyn TensorLike>> {
        self.grad_tensor().map(|g| g as Rc<dyn TensorLike>)
    }
}

/// Creates tensors and remembers them weakly for enumeration.
pub struct TensorRegistry {
    allocator: Rc<CachingAllocator>,
    next_buffer: Cell<u64>,
    live: RefCell<Vec<Weak<Tensor>>>,
}

impl TensorRegistry {
    pub fn new(allocator: Rc<CachingAllocator>) -> Self {
        Self {
            allocator,
            next_buffer: Cell::new(1),
            live: RefCell::new(Vec::new()),
        }
    }

    pub fn allocator(&self) -> &Rc<CachingAllocator> {
        &self.allocator
    }

    fn track(&self, tensor: Tensor) -> Rc<Tensor> {
        let tensor = Rc::new(tensor);
        let mut live = self.live.borrow_mut();
        live.retain(|t| t.strong_count() > 0);
        live.push(Rc::downgrade(&tensor));
        tensor
    }

    /// Allocate an uninitialised tensor on `device`.
    pub fn empty(
        &self,
        shape: &[usize],
        dtype: DType,
        device: DeviceId,
    ) -> Result<Rc<Tensor>, DeviceError> {
        let numel: usize = shape.iter().product();
        let bytes = numel as u64 * dtype.size();
        let block = self.allocator.allocate(device, bytes)?;

        let id = BufferId::new(self.next_buffer.get());
        self.next_buffer.set(id.raw() + 1);
        let storage = Rc::new(Storage {
            id,
            bytes,
            device,
            block: Some(block),
            allocator: Rc::clone(&self.allocator),
        });
        Ok(self.track(Tensor {
            storage,
            shape: shape.to_vec(),
            dtype,
            grad: RefCell::new(None),
        }))
    }

    /// A new tensor object over `base`'s storage.
    pub fn view(&self, base: &Tensor, shape: &[usize]) -> Rc<Tensor> {
        self.track(Tensor {
            storage: Rc::clone(&base.storage),
            shape: shape.to_vec(),
            dtype: base.dtype,
            grad: RefCell::new(None),
        })
    }

    /// Live tensors without pruning.
    pub fn live_count(&self) -> usize {
        self.live.borrow().iter().filter(|t| t.strong_count() > 0).count()
    }
}

impl LiveObjects for TensorRegistry {
    fn live_tensors(&self) -> Vec<Rc<dyn TensorLike>> {
        let mut live = self.live.borrow_mut();
        live.retain(|t| t.strong_count() > 0);
        live.iter()
            .filter_map(Weak::upgrade)
            .map(|t| t as Rc<dyn TensorLike>)
            .collect()
    }
}

/// A container of named parameters, buffers and submodules.
#[derive(Default)]
pub struct Module {
    tensors: RefCell<Vec<(String, Rc<Tensor>)>>,
    children: RefCell<Vec<(String, Node)>>,
}

impl Module {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Register a parameter or buffer.
    pub fn register_tensor(&self, name: &str, tensor: Rc<Tensor>) {
        self.tensors.borrow_mut().push((name.to_string(), tensor));
    }

    pub fn register_module(&self, name: &str, module: Rc<Module>) {
        self.children
            .borrow_mut()
            .push((name.to_string(), Node::Composite(module)));
    }

    /// Register any other reachable value, e.g. a foreign tensor type.
    pub fn register_node(&self, name: &str, node: Node) {
        self.children.borrow_mut().push((name.to_string(), node));
    }

    pub fn tensor(&self, name: &str) -> Option<Rc<Tensor>> {
        self.tensors
            .borrow()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| Rc::clone(t))
    }

    /// Drop every registered child, breaking reference cycles.
    pub fn clear(&self) {
        self.tensors.borrow_mut().clear();
        self.children.borrow_mut().clear();
    }

    pub fn as_node(self: &Rc<Self>) -> Node {
        Node::Composite(Rc::clone(self) as Rc<dyn Composite>)
    }
}

impl Composite for Module {
    fn children(&self) -> Vec<(String, Node)> {
        let tensors = self
            .tensors
            .borrow()
            .iter()
            .map(|(name, t)| (name.clone(), Node::Tensor(Rc::clone(t) as Rc<dyn TensorLike>)))
            .collect::<Vec<_>>();
        tensors
            .into_iter()
            .chain(self.children.borrow().iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memlab_env::DeviceMemory;

    const DEV: DeviceId = DeviceId::new(0);

    #[test]
    fn storage_is_freed_when_last_view_drops() {
        let alloc = Rc::new(CachingAllocator::new(1));
        let registry = TensorRegistry::new(alloc.clone());

        let t = registry.empty(&[256, 1024], DType::F32, DEV).unwrap();
        let v = registry.view(&t, &[1024, 256]);
        assert!(t.shares_storage(&v));
        assert_eq!(alloc.allocated_bytes(DEV).unwrap(), 1024 * 1024);

        drop(t);
        assert_eq!(alloc.allocated_bytes(DEV).unwrap(), 1024 * 1024);
        drop(v);
        assert_eq!(alloc.allocated_bytes(DEV).unwrap(), 0);
    }

    #[test]
    fn registry_enumerates_live_tensors_in_creation_order() {
        let alloc = Rc::new(CachingAllocator::new(1));
        let registry = TensorRegistry::new(alloc);

        let a = registry.empty(&[2], DType::F32, DEV).unwrap();
        let b = registry.empty(&[3], DType::F32, DEV).unwrap();
        let c = registry.empty(&[4], DType::F32, DEV).unwrap();
        drop(b);

        let live = registry.live_tensors();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].buffer_id(), a.buffer_id());
        assert_eq!(live[1].buffer_id(), c.buffer_id());
        assert_eq!(registry.live_count(), 2);
    }

    #[test]
    fn dead_entries_are_pruned_on_creation() {
        let alloc = Rc::new(CachingAllocator::new(1));
        let registry = TensorRegistry::new(alloc);

        let keep = registry.empty(&[8], DType::F32, DEV).unwrap();
        for _ in 0..16 {
            let scratch = registry.empty(&[8], DType::F32, DEV).unwrap();
            drop(scratch);
        }
        assert!(registry.live.borrow().len() <= 2);
        assert_eq!(registry.live_count(), 1);
        drop(keep);
    }

    #[test]
    fn module_yields_tensors_before_submodules() {
        let alloc = Rc::new(CachingAllocator::new(1));
        let registry = TensorRegistry::new(alloc);
        let child = Module::new();
        let root = Module::new();
        root.register_module("head", child);
        root.register_tensor("weight", registry.empty(&[4], DType::F16, DEV).unwrap());

        let names: Vec<String> = root.children().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["weight", "head"]);
        assert!(root.tensor("weight").is_some());
    }

    #[test]
    fn allocation_errors_propagate() {
        let registry = TensorRegistry::new(Rc::new(CachingAllocator::new(1)));
        let err = registry.empty(&[1], DType::F32, DeviceId::new(5)).err();
        assert!(matches!(err, Some(DeviceError::InvalidDevice { .. })));
    }
}
