use std::cell::RefCell;
use std::time::{Duration, SystemTime};

use httpdate::HttpDate;

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

/// Appends the current GMT date string to `dst`.
pub(crate) fn extend(dst: &mut Vec<u8>) {
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache.check();
        dst.extend_from_slice(cache.value.as_bytes());
    })
}

/// The current GMT date string, e.g. `Tue, 15 Nov 1994 08:12:31 GMT`.
pub(crate) fn now() -> String {
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache.check();
        cache.value.clone()
    })
}

// Formatting a date is visible on the response hot path, so the rendered
// string is cached per thread and refreshed at most once a second.
struct CachedDate {
    value: String,
    next_update: SystemTime,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate::new()));

impl CachedDate {
    fn new() -> Self {
        let mut cache = CachedDate {
            value: String::with_capacity(DATE_VALUE_LENGTH),
            next_update: SystemTime::UNIX_EPOCH,
        };
        cache.update(SystemTime::now());
        cache
    }

    fn check(&mut self) {
        let now = SystemTime::now();
        if now > self.next_update {
            self.update(now);
        }
    }

    fn update(&mut self, now: SystemTime) {
        self.value = HttpDate::from(now).to_string();
        debug_assert_eq!(self.value.len(), DATE_VALUE_LENGTH);
        self.next_update = now + Duration::from_secs(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_len() {
        assert_eq!(now().len(), DATE_VALUE_LENGTH);
    }

    #[test]
    fn date_shape() {
        let date = now();
        assert!(date.ends_with(" GMT"), "{:?}", date);
        assert_eq!(&date[3..5], ", ");
    }

    #[test]
    fn extend_appends() {
        let mut dst = b"Date: ".to_vec();
        extend(&mut dst);
        assert_eq!(dst.len(), 6 + DATE_VALUE_LENGTH);
    }
}
