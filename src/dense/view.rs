//! Typed windows over foreign linear memory.
//!
//! A [`BufferDescriptor`](super::BufferDescriptor) is offsets and counts; a
//! view is what callers actually read. Given an element-kind tag, the view
//! factory builds a read or write window over the descriptor's bytes.
//! Ownership never transfers: views borrow the engine's memory (through the
//! runtime's lock) and carry an access token so that every
//! allocation-capable call fails fast while the view is alive.
//!
//! Elements are decoded per access with explicit little-endian reads — no
//! pointer reinterpretation, no unsafe.

use parking_lot::MappedRwLockReadGuard;

use super::guard::AccessToken;
use super::BufferDescriptor;
use crate::engine::ElementType;

/// An element kind that can live in an attribute buffer.
///
/// Implementations exist for exactly the types the engine stores; the
/// `TYPE` tag ties the Rust type back to the native constant.
pub trait Element: Copy + Default {
    const TYPE: ElementType;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_element {
    ($ty:ty, $tag:expr) => {
        impl Element for $ty {
            const TYPE: ElementType = $tag;

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                <$ty>::from_le_bytes(buf)
            }

            fn write_le(self, bytes: &mut [u8]) {
                bytes[..std::mem::size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_element!(u8, ElementType::U8);
impl_element!(u32, ElementType::U32);
impl_element!(i64, ElementType::I64);
impl_element!(u64, ElementType::U64);
impl_element!(f32, ElementType::F32);
impl_element!(f64, ElementType::F64);

/// Read-only typed window over a dense buffer.
///
/// Holds a read lock on the engine plus an access token for the buffer
/// guard; both release on drop. Indexing is by dense position, not entity
/// id — position 0 is the first active entity in the descriptor's order.
pub struct DenseView<'a, T: Element> {
    bytes: MappedRwLockReadGuard<'a, [u8]>,
    count: usize,
    stride: usize,
    dimension: usize,
    _token: AccessToken<'a>,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T: Element> DenseView<'a, T> {
    pub(crate) fn new(
        bytes: MappedRwLockReadGuard<'a, [u8]>,
        desc: &BufferDescriptor,
        dimension: usize,
        token: AccessToken<'a>,
    ) -> Self {
        Self {
            bytes,
            count: desc.count,
            stride: desc.stride,
            dimension,
            _token: token,
            _marker: std::marker::PhantomData,
        }
    }

    /// Number of entities covered.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Components per entity.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// First component of the entity at dense position `index`.
    pub fn get(&self, index: usize) -> Option<T> {
        self.component(index, 0)
    }

    /// Component `dim` of the entity at dense position `index`.
    pub fn component(&self, index: usize, dim: usize) -> Option<T> {
        if index >= self.count || dim >= self.dimension {
            return None;
        }
        let at = index * self.stride + dim * std::mem::size_of::<T>();
        Some(T::read_le(&self.bytes[at..]))
    }

    /// Iterator over the first component of every entity.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.count).map(move |i| {
            let at = i * self.stride;
            T::read_le(&self.bytes[at..])
        })
    }

    /// Copies the first component of every entity out of foreign memory.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }
}

/// Mutable typed window over an attribute's backing buffer.
///
/// Only reachable through `GraphRuntime::with_attribute_mut`, which bumps
/// the attribute version once the closure returns. Indexing is by entity
/// id (capacity-sized storage), not dense position.
pub struct DenseViewMut<'a, T: Element> {
    bytes: &'a mut [u8],
    capacity: usize,
    stride: usize,
    dimension: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T: Element> DenseViewMut<'a, T> {
    pub(crate) fn new(
        bytes: &'a mut [u8],
        capacity: usize,
        stride: usize,
        dimension: usize,
    ) -> Self {
        Self {
            bytes,
            capacity,
            stride,
            dimension,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// First component stored for entity `id`.
    pub fn get(&self, id: u32) -> Option<T> {
        self.component(id, 0)
    }

    pub fn component(&self, id: u32, dim: usize) -> Option<T> {
        let id = id as usize;
        if id >= self.capacity || dim >= self.dimension {
            return None;
        }
        let at = id * self.stride + dim * std::mem::size_of::<T>();
        Some(T::read_le(&self.bytes[at..]))
    }

    /// Writes the first component for entity `id`.
    pub fn set(&mut self, id: u32, value: T) -> bool {
        self.set_component(id, 0, value)
    }

    pub fn set_component(&mut self, id: u32, dim: usize, value: T) -> bool {
        let id = id as usize;
        if id >= self.capacity || dim >= self.dimension {
            return false;
        }
        let at = id * self.stride + dim * std::mem::size_of::<T>();
        value.write_le(&mut self.bytes[at..]);
        true
    }
}

/// Resolved view over a dense index (active id list) buffer.
///
/// The identity variant is synthesized locally — the active range was
/// contiguous, so the id list is just `start..end` and no foreign buffer
/// exists at all.
pub enum IndexView<'a> {
    /// Contiguous active range; ids are `start..end`.
    Identity { start: u32, end: u32 },
    /// Engine-packed id list.
    Packed(DenseView<'a, u32>),
}

impl<'a> IndexView<'a> {
    pub fn len(&self) -> usize {
        match self {
            IndexView::Identity { start, end } => (*end - *start) as usize,
            IndexView::Packed(view) => view.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, position: usize) -> Option<u32> {
        match self {
            IndexView::Identity { start, end } => {
                let id = start.checked_add(position as u32)?;
                (id < *end).then_some(id)
            }
            IndexView::Packed(view) => view.get(position),
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = u32> + '_> {
        match self {
            IndexView::Identity { start, end } => Box::new(*start..*end),
            IndexView::Packed(view) => Box::new(view.iter()),
        }
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_round_trips_little_endian() {
        let mut buf = [0u8; 8];
        42.5f64.write_le(&mut buf);
        assert_eq!(f64::read_le(&buf), 42.5);

        let mut buf = [0u8; 4];
        7u32.write_le(&mut buf);
        assert_eq!(u32::read_le(&buf), 7);
        assert_eq!(buf, 7u32.to_le_bytes());
    }

    #[test]
    fn mutable_view_respects_capacity() {
        let mut bytes = vec![0u8; 4 * 4];
        let mut view = DenseViewMut::<u32>::new(&mut bytes, 4, 4, 1);
        assert!(view.set(3, 99));
        assert!(!view.set(4, 1));
        assert_eq!(view.get(3), Some(99));
        assert_eq!(view.get(4), None);
    }

    #[test]
    fn identity_index_is_synthesized() {
        let view = IndexView::Identity { start: 2, end: 6 };
        assert_eq!(view.len(), 4);
        assert_eq!(view.get(0), Some(2));
        assert_eq!(view.get(3), Some(5));
        assert_eq!(view.get(4), None);
        assert_eq!(view.to_vec(), vec![2, 3, 4, 5]);
    }
}
