#[macro_export]
/// A helper macro to get the last item in the [crate::bail_error] macro, which will be the error message.
macro_rules! last {
  ([$single:tt] $($rest:tt)*) => {
    $single
  };
  ([$first:tt $($rest:tt)*] $($reversed:tt)*) => {
    $crate::last!([$($rest)*] $first $($reversed)*)
  };
}

#[macro_export]
/// Log an error with structured details, then raise the message as an [anyhow::Error].
///
/// # Example
/// ```
/// use labforge_library::bail_error;
///
/// fn fails() -> anyhow::Result<()> {
///   let tid = "test".to_string();
///   bail_error!(tid=%tid, "Container runtime is unreachable");
/// }
/// assert_eq!(fails().err().unwrap().to_string(), "Container runtime is unreachable");
/// ```
macro_rules! bail_error {
  ($($arg:tt)+) => {
    {
      tracing::error!($($arg)+);
      anyhow::bail!($crate::last!([$($arg)+]))
    }
  };
}

#[macro_export]
/// Log a typed error with structured details, then return it wrapped in an [anyhow::Error].
/// The typed value stays available to callers through `downcast_ref`.
///
/// # Example
/// ```
/// use labforge_library::bail_typed;
///
/// #[derive(Debug)]
/// struct Exhausted;
/// impl std::fmt::Display for Exhausted {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "exhausted")
///     }
/// }
/// impl std::error::Error for Exhausted {}
///
/// fn fails() -> anyhow::Result<()> {
///   let tid = "test".to_string();
///   bail_typed!(Exhausted, tid=%tid, "Nothing left");
/// }
/// assert!(fails().err().unwrap().downcast_ref::<Exhausted>().is_some());
/// ```
macro_rules! bail_typed {
  ($err:expr, $($arg:tt)+) => {
    {
      tracing::warn!($($arg)+);
      anyhow::bail!($err)
    }
  };
}
