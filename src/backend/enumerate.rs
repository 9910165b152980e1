// Capability enumeration - the driver's two-call list protocol
//
// Vulkan hands out variable-length lists (layers, extensions, devices,
// formats, present modes, swapchain images) by first reporting a count and
// then filling a caller-sized buffer. If the live set grows between the two
// calls the driver answers INCOMPLETE and we start over.

use anyhow::{bail, Result};
use ash::vk;
use std::ptr;

/// Run the count-then-fill protocol until the driver reports a stable set.
///
/// `query` receives the count slot and either a null pointer (count query)
/// or a pointer to `count` default-initialised elements (fill query).
/// INCOMPLETE restarts the cycle; any other non-SUCCESS code is fatal.
pub fn enumerate<T, F>(what: &str, mut query: F) -> Result<Vec<T>>
where
    T: Default + Clone,
    F: FnMut(&mut u32, *mut T) -> vk::Result,
{
    let mut retries = 0u32;

    loop {
        let mut count = 0u32;
        match query(&mut count, ptr::null_mut()) {
            vk::Result::SUCCESS => {}
            vk::Result::INCOMPLETE => {
                retries += 1;
                continue;
            }
            err => bail!("Failed to enumerate {}: count query returned {:?}", what, err),
        }

        let mut items = vec![T::default(); count as usize];
        match query(&mut count, items.as_mut_ptr()) {
            vk::Result::SUCCESS => {
                // The driver may report fewer entries than it counted
                items.truncate(count as usize);
                if retries > 0 {
                    log::debug!("Enumerated {} {} after {} retries", items.len(), what, retries);
                }
                return Ok(items);
            }
            vk::Result::INCOMPLETE => {
                retries += 1;
                log::debug!("{} changed while enumerating, retrying", what);
            }
            err => bail!("Failed to enumerate {}: returned {:?}", what, err),
        }
    }
}

/// Convert a fixed-size, NUL-terminated name field (layer or extension name)
/// into an owned string.
pub fn name_from_raw(raw: &[std::os::raw::c_char]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fake driver list that grows by one entry on each of the first
    /// `growths` fill calls, reporting INCOMPLETE each time.
    struct GrowingList {
        items: Vec<u32>,
        growths: u32,
        count_calls: u32,
        fill_calls: u32,
        last_count: u32,
    }

    impl GrowingList {
        fn new(len: u32, growths: u32) -> Self {
            Self {
                items: (0..len).collect(),
                growths,
                count_calls: 0,
                fill_calls: 0,
                last_count: 0,
            }
        }

        fn query(&mut self, count: &mut u32, data: *mut u32) -> vk::Result {
            if data.is_null() {
                self.count_calls += 1;
                *count = self.items.len() as u32;
                self.last_count = *count;
                return vk::Result::SUCCESS;
            }

            self.fill_calls += 1;
            if self.growths > 0 {
                self.growths -= 1;
                let next = self.items.len() as u32;
                self.items.push(next);
            }

            let capacity = *count as usize;
            let written = capacity.min(self.items.len());
            for (i, item) in self.items.iter().take(written).enumerate() {
                unsafe { *data.add(i) = *item };
            }
            *count = written as u32;

            if written < self.items.len() {
                vk::Result::INCOMPLETE
            } else {
                vk::Result::SUCCESS
            }
        }
    }

    #[test]
    fn stable_set_needs_one_cycle() {
        let mut driver = GrowingList::new(4, 0);
        let items = enumerate("things", |c, d| driver.query(c, d)).unwrap();

        assert_eq!(items, vec![0, 1, 2, 3]);
        assert_eq!(driver.count_calls, 1);
        assert_eq!(driver.fill_calls, 1);
    }

    #[test]
    fn growth_between_calls_is_retried() {
        for growths in 1..5 {
            let mut driver = GrowingList::new(2, growths);
            let items = enumerate("things", |c, d| driver.query(c, d)).unwrap();

            // N incomplete answers mean N extra count-then-fill cycles
            assert_eq!(driver.count_calls, growths + 1);
            assert_eq!(driver.fill_calls, growths + 1);
            assert_eq!(items.len() as u32, driver.last_count);
            assert_eq!(items.len() as u32, 2 + growths);
        }
    }

    #[test]
    fn empty_set_is_not_an_error() {
        let mut driver = GrowingList::new(0, 0);
        let items = enumerate("things", |c, d| driver.query(c, d)).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn error_on_count_query_is_fatal() {
        let err = enumerate::<u32, _>("layers", |_, _| vk::Result::ERROR_OUT_OF_HOST_MEMORY)
            .unwrap_err();
        assert!(err.to_string().contains("layers"));
    }

    #[test]
    fn error_on_fill_query_is_fatal() {
        let err = enumerate::<u32, _>("formats", |count, data| {
            if data.is_null() {
                *count = 3;
                vk::Result::SUCCESS
            } else {
                vk::Result::ERROR_SURFACE_LOST_KHR
            }
        })
        .unwrap_err();
        assert!(err.to_string().contains("formats"));
    }

    #[test]
    fn raw_names_stop_at_nul() {
        let mut raw = [0 as std::os::raw::c_char; 16];
        for (i, b) in b"VK_KHR_swapchain".iter().take(15).enumerate() {
            raw[i] = *b as std::os::raw::c_char;
        }
        raw[15] = 0;
        assert_eq!(name_from_raw(&raw), "VK_KHR_swapchai");
    }
}
