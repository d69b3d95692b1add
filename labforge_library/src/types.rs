/// Allows a trait object to be cast back into its concrete type.
/// Implement with `#[derive(labforge_library::ToAny)]`.
pub trait ToAny: 'static {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Cast a trait object implementing [ToAny] into the concrete type `T`.
pub fn cast<T: 'static, U: ToAny + ?Sized>(item: &U) -> Option<&T> {
    item.as_any().downcast_ref::<T>()
}
