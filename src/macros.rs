//! Convenience macros

/// Macro to produce a `&'static` [`SourceLocation`] for the current line.
///
/// The location captures the enclosing module path, file and line. Usage is as follows:
/// ```
/// # use gpu_timeline::source_location;
/// let shadows = source_location!("shadows");
/// let lights = source_location!("lights", 0xFF_80_00);
/// assert_eq!(lights.color, 0xFF_80_00);
/// assert_ne!(shadows.token(), lights.token());
/// ```
///
/// [`SourceLocation`]: crate::SourceLocation
#[macro_export]
macro_rules! source_location {
    ($name:expr) => {
        $crate::source_location!($name, 0)
    };
    ($name:expr, $color:expr) => {{
        static LOCATION: $crate::SourceLocation = $crate::SourceLocation {
            name: $name,
            function: module_path!(),
            file: file!(),
            line: line!(),
            color: $color,
        };
        &LOCATION
    }};
}

/// Macro to open a [`ZoneScope`] named after a string literal.
///
/// Expands to a call of [`QueueContext::zone`], so it evaluates to a
/// `Result<ZoneScope, QueryError>`:
/// ```ignore
/// let pass = zone!(context, &mut encoder, "shadows")?;
/// let tinted = zone!(context, &mut encoder, "lights", color = 0xFF_80_00)?;
/// let maybe = zone!(context, &mut encoder, "debug", cfg!(debug_assertions))?;
/// ```
///
/// [`ZoneScope`]: crate::ZoneScope
/// [`QueueContext::zone`]: crate::QueueContext::zone
#[macro_export]
macro_rules! zone {
    ($context:expr, $encoder:expr, $name:expr) => {
        $crate::zone!($context, $encoder, $name, true)
    };
    ($context:expr, $encoder:expr, $name:expr, color = $color:expr) => {
        ($context).zone($encoder, $crate::source_location!($name, $color), true)
    };
    ($context:expr, $encoder:expr, $name:expr, $active:expr) => {
        ($context).zone($encoder, $crate::source_location!($name), $active)
    };
}

#[test]
fn test_source_location() {
    let first = source_location!("first");
    let second = source_location!("second", 0x12_34_56);
    assert_eq!(first.name, "first");
    assert_eq!(first.color, 0);
    assert_eq!(first.file, file!());
    assert_eq!(second.line, first.line + 1);
    assert_eq!(second.function, module_path!());
    assert_ne!(first.token(), second.token());
}
