//! Paged on-disk lists.
//!
//! A report that would be too large to hold in memory is stored as a
//! directory of numbered page files, each a compressed JSON blob of up to
//! [`PAGE_SIZE`] consecutive items. Random access and slicing decode only
//! the pages they touch, with a tiny per-list LRU keeping the most recently
//! used pages warm.

use crate::{
    compression::Compression,
    error::{EngineError, Result},
};
use lru::LruCache;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    cell::RefCell,
    fs,
    num::NonZeroUsize,
    ops::Range,
    path::{Path, PathBuf},
    rc::Rc,
};

/// Number of items per page. Also the threshold above which the artifact
/// store switches a report from a single blob to a paged list.
pub const PAGE_SIZE: usize = 500;

/// Pages kept decoded per list.
pub const PAGE_CACHE_SIZE: usize = 2;

/// A fixed-length list whose items live in numbered page files on disk.
#[derive(Debug)]
pub struct PagedList<T> {
    pages_dir: PathBuf,
    page_size: usize,
    len: usize,
    page_count: usize,
    compression: Compression,
    cache: RefCell<LruCache<usize, Rc<Vec<T>>>>,
}

impl<T: Serialize + DeserializeOwned + Clone> PagedList<T> {
    /// Writes `items` out as pages under `pages_dir`.
    ///
    /// Pages are first written to a `.tmp` sibling directory which is then
    /// renamed into place, so a crash mid-write never leaves a partially
    /// visible list. An existing directory at `pages_dir` is replaced.
    pub fn create(
        items: &[T],
        pages_dir: impl Into<PathBuf>,
        page_size: usize,
        compression: Compression,
    ) -> Result<Self> {
        let pages_dir = pages_dir.into();
        let tmp_dir = crate::utils::tmp_sibling(&pages_dir);
        let _ = fs::remove_dir_all(&tmp_dir);
        fs::create_dir_all(&tmp_dir).map_err(|err| EngineError::storage(err, &tmp_dir))?;

        let build = || -> Result<usize> {
            let mut page_count = 0;
            let pages: Vec<&[T]> = if items.is_empty() {
                vec![&[]]
            } else {
                items.chunks(page_size).collect()
            };
            for (index, page) in pages.iter().enumerate() {
                let bytes = compression
                    .encode(page)
                    .map_err(|err| EngineError::storage(err, &tmp_dir))?;
                let page_path = tmp_dir.join(index.to_string());
                fs::write(&page_path, bytes)
                    .map_err(|err| EngineError::storage(err, page_path.clone()))?;
                page_count = index + 1;
            }
            let _ = fs::remove_dir_all(&pages_dir);
            fs::rename(&tmp_dir, &pages_dir)
                .map_err(|err| EngineError::storage(err, &pages_dir))?;
            Ok(page_count)
        };

        match build() {
            Ok(page_count) => Ok(Self::open(
                pages_dir,
                page_size,
                items.len(),
                page_count,
                compression,
            )),
            Err(err) => {
                let _ = fs::remove_dir_all(&tmp_dir);
                Err(err)
            }
        }
    }

    /// Reattaches to a pages directory written earlier, e.g. after a
    /// snapshot restore. No I/O happens until a page is requested.
    pub fn open(
        pages_dir: impl Into<PathBuf>,
        page_size: usize,
        len: usize,
        page_count: usize,
        compression: Compression,
    ) -> Self {
        let capacity = NonZeroUsize::new(PAGE_CACHE_SIZE).unwrap();
        PagedList {
            pages_dir: pages_dir.into(),
            page_size,
            len,
            page_count,
            compression,
            cache: RefCell::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn pages_dir(&self) -> &Path {
        &self.pages_dir
    }

    fn page(&self, index: usize) -> Result<Rc<Vec<T>>> {
        if let Some(page) = self.cache.borrow_mut().get(&index) {
            return Ok(page.clone());
        }
        let path = self.pages_dir.join(index.to_string());
        let bytes = fs::read(&path).map_err(|err| EngineError::storage(err, path.clone()))?;
        let items: Vec<T> = self
            .compression
            .decode(&bytes)
            .map_err(|err| EngineError::storage(err, path))?;
        let page = Rc::new(items);
        self.cache.borrow_mut().put(index, page.clone());
        Ok(page)
    }

    pub fn get(&self, index: usize) -> Result<T> {
        if index >= self.len {
            return Err(EngineError::msg(format!(
                "index {index} out of bounds for paged list of length {}",
                self.len
            )));
        }
        let page = self.page(index / self.page_size)?;
        Ok(page[index % self.page_size].clone())
    }

    /// Returns `items[range]`, touching only the pages the range overlaps.
    pub fn slice(&self, range: Range<usize>) -> Result<Vec<T>> {
        let start = range.start.min(self.len);
        let stop = range.end.min(self.len);
        if start >= stop {
            return Ok(Vec::new());
        }
        let first_page = start / self.page_size;
        let last_page = (stop - 1) / self.page_size;
        let mut out = Vec::with_capacity(stop - start);
        for page_index in first_page..=last_page {
            let page = self.page(page_index)?;
            let page_start = page_index * self.page_size;
            let lo = start.saturating_sub(page_start);
            let hi = (stop - page_start).min(page.len());
            out.extend_from_slice(&page[lo..hi]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn numbers(n: usize) -> Vec<u32> {
        (0..n as u32).collect()
    }

    #[test]
    fn get_and_slice() {
        let dir = tempfile::tempdir().unwrap();
        let list =
            PagedList::create(&[3u32, 4, 5, 6], dir.path().join("p"), 2, Compression::Gzip)
                .unwrap();
        assert_eq!(list.get(1).unwrap(), 4);
        assert_eq!(list.slice(1..3).unwrap(), vec![4, 5]);
        assert_eq!(list.slice(0..4).unwrap(), vec![3, 4, 5, 6]);
        assert!(list.get(6).is_err());
    }

    #[test]
    fn slices_across_page_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let items = numbers(13);
        let list = PagedList::create(&items, dir.path().join("p"), 5, Compression::None).unwrap();
        assert_eq!(list.page_count(), 3);
        assert_eq!(list.slice(3..12).unwrap(), items[3..12].to_vec());
        assert_eq!(list.slice(0..13).unwrap(), items);
        assert_eq!(list.slice(12..13).unwrap(), vec![12]);
        assert_eq!(list.slice(13..20).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn page_count_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let exact =
            PagedList::create(&numbers(10), dir.path().join("a"), 10, Compression::Gzip).unwrap();
        assert_eq!(exact.page_count(), 1);
        let over =
            PagedList::create(&numbers(11), dir.path().join("b"), 10, Compression::Gzip).unwrap();
        assert_eq!(over.page_count(), 2);
    }

    #[test]
    fn empty_list_has_one_page() {
        let dir = tempfile::tempdir().unwrap();
        let list: PagedList<u32> =
            PagedList::create(&[], dir.path().join("p"), 4, Compression::Gzip).unwrap();
        assert_eq!(list.page_count(), 1);
        assert_eq!(list.len(), 0);
        assert!(list.get(0).is_err());
        assert_eq!(list.slice(0..1).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn reopen_reads_same_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p");
        let items = numbers(7);
        let list = PagedList::create(&items, &path, 3, Compression::Bz2).unwrap();
        let reopened: PagedList<u32> =
            PagedList::open(&path, 3, list.len(), list.page_count(), Compression::Bz2);
        assert_eq!(reopened.slice(0..7).unwrap(), items);
    }

    #[test]
    fn create_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p");
        PagedList::create(&numbers(9), &path, 2, Compression::Gzip).unwrap();
        let second = PagedList::create(&numbers(3), &path, 2, Compression::Gzip).unwrap();
        assert_eq!(second.page_count(), 2);
        // Stale page files from the first list are gone.
        assert!(!path.join("4").exists());
    }
}
