use super::*;

#[test]
fn test_ceil_div() {
    assert_eq!(ceil_div(0, 16), 0);
    assert_eq!(ceil_div(1, 16), 1);
    assert_eq!(ceil_div(16, 16), 1);
    assert_eq!(ceil_div(17, 16), 2);
    assert_eq!(ceil_div(u64::MAX, 1), u64::MAX);
    assert_eq!(ceil_div(u64::MAX, u64::MAX), 1);
}

#[test]
fn test_convert() {
    assert_eq!(to_usize(0).unwrap(), 0);
    assert_eq!(to_u64(1024).unwrap(), 1024);
}
