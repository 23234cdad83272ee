///////////////////
// Vector macros //
///////////////////

/// Assertion that all vectors have the same length.
#[macro_export]
macro_rules! assert_same_len {
    ($($vec:expr),+ $(,)?) => {
        {
            let lengths: Vec<usize> = vec![$($vec.len()),+];
            let first_len = lengths[0];

            if !lengths.iter().all(|&len| len == first_len) {
                panic!(
                    "Vectors have different lengths: {:?}",
                    lengths
                );
            }
        }
    };
}

/////////////////////
// Checked returns //
/////////////////////

/// Return a `DimensionMismatch` error from the enclosing function if the two
/// sizes differ.
#[macro_export]
macro_rules! ensure_dims {
    ($what:expr, $expected:expr, $found:expr) => {
        if $expected != $found {
            return Err($crate::error::ScError::DimensionMismatch {
                what: $what.to_string(),
                expected: $expected,
                found: $found,
            });
        }
    };
}
