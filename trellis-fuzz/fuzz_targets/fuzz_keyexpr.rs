#![no_main]

use libfuzzer_sys::fuzz_target;
use trellis_core::keyexpr::KeyExpr;

// Input: two key expressions separated by a NUL byte.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let (left, right) = text.split_once('\0').unwrap_or((text, text));

    let Ok(a) = KeyExpr::autocanonize(left) else {
        return;
    };
    // canonical form is stable and accepted as-is
    assert!(KeyExpr::new(a.as_str()).is_ok());
    assert_eq!(
        KeyExpr::autocanonize(a.as_str()).map(|k| k.as_str().to_owned()).ok(),
        Some(a.as_str().to_owned())
    );
    assert!(a.intersects(&a));
    assert!(a.includes(&a));

    let Ok(b) = KeyExpr::autocanonize(right) else {
        return;
    };
    assert_eq!(a.intersects(&b), b.intersects(&a));
    if a.includes(&b) {
        assert!(a.intersects(&b));
    }
    if let Ok(joined) = a.join(b.as_str()) {
        assert!(KeyExpr::new(joined.as_str()).is_ok());
    }
});
