use crate::utils::error::FedResult;
use futures_util::future;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::HashSet;
use std::hash::Hash;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Closeable, lazily pulled result sequence.
///
/// Buffered cursors hold fully materialized results (e.g. a parsed remote
/// response); stream cursors pull from an executor or a combinator chain.
/// Closing a cursor drops whatever it wraps, which releases the producer.
pub struct Cursor<T> {
    inner: CursorInner<T>,
}

enum CursorInner<T> {
    Empty,
    Buffered(std::vec::IntoIter<T>),
    Stream(BoxStream<'static, FedResult<T>>),
    Closed,
}

// No structural pinning of `T` takes place.
impl<T> Unpin for Cursor<T> {}

impl<T: Send + 'static> Cursor<T> {
    pub fn empty() -> Self {
        Self { inner: CursorInner::Empty }
    }

    /// Cursor yielding exactly `item`
    pub fn single(item: T) -> Self {
        Self::from_vec(vec![item])
    }

    pub fn from_vec(items: Vec<T>) -> Self {
        if items.is_empty() {
            Self::empty()
        } else {
            Self {
                inner: CursorInner::Buffered(items.into_iter()),
            }
        }
    }

    /// Wrap a fallible stream
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = FedResult<T>> + Send + 'static,
    {
        Self {
            inner: CursorInner::Stream(stream.boxed()),
        }
    }

    /// True when the cursor is known to yield nothing without polling it
    pub fn is_known_empty(&self) -> bool {
        match &self.inner {
            CursorInner::Empty | CursorInner::Closed => true,
            CursorInner::Buffered(items) => items.as_slice().is_empty(),
            CursorInner::Stream(_) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.inner, CursorInner::Closed)
    }

    /// Release the underlying producer; further polls yield nothing
    pub fn close(&mut self) {
        self.inner = CursorInner::Closed;
    }

    /// Drain the cursor, stopping at the first error
    pub async fn collect_all(mut self) -> FedResult<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Transform items; errors pass through
    pub fn map_ok<U, F>(self, mut f: F) -> Cursor<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        match self.inner {
            CursorInner::Empty | CursorInner::Closed => Cursor::empty(),
            CursorInner::Buffered(items) => Cursor::from_vec(items.map(f).collect()),
            CursorInner::Stream(s) => Cursor::from_stream(s.map(move |item| item.map(&mut f))),
        }
    }

    /// Keep items satisfying `predicate`; errors pass through
    pub fn filter_ok<F>(self, mut predicate: F) -> Cursor<T>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        match self.inner {
            CursorInner::Empty | CursorInner::Closed => Cursor::empty(),
            CursorInner::Buffered(items) => Cursor::from_vec(items.filter(|i| predicate(i)).collect()),
            CursorInner::Stream(s) => Cursor::from_stream(s.filter(move |item| {
                let keep = match item {
                    Ok(value) => predicate(value),
                    Err(_) => true,
                };
                future::ready(keep)
            })),
        }
    }

    /// Skip `offset` items, then yield at most `limit`
    pub fn slice(self, offset: usize, limit: Option<usize>) -> Cursor<T> {
        let skipped = self.skip(offset);
        match limit {
            Some(limit) => Cursor::from_stream(skipped.take(limit)),
            None => Cursor::from_stream(skipped),
        }
    }

    /// Concatenate cursors in order
    pub fn chain_all(cursors: Vec<Cursor<T>>) -> Cursor<T> {
        let live: Vec<Cursor<T>> = cursors.into_iter().filter(|c| !c.is_known_empty()).collect();
        match live.len() {
            0 => Cursor::empty(),
            1 => live.into_iter().next().unwrap_or_else(Cursor::empty),
            _ => Cursor::from_stream(stream::iter(live).flatten()),
        }
    }
}

impl<T: Clone + Eq + Hash + Send + 'static> Cursor<T> {
    pub fn distinct(self) -> Cursor<T> {
        let mut seen: HashSet<T> = HashSet::new();
        self.filter_ok(move |item| seen.insert(item.clone()))
    }
}

impl<T: Send + 'static> Stream for Cursor<T> {
    type Item = FedResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match &mut this.inner {
            CursorInner::Empty | CursorInner::Closed => Poll::Ready(None),
            CursorInner::Buffered(items) => Poll::Ready(items.next().map(Ok)),
            CursorInner::Stream(s) => s.poll_next_unpin(cx),
        }
    }
}

impl<T> std::fmt::Debug for Cursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.inner {
            CursorInner::Empty => "empty",
            CursorInner::Buffered(_) => "buffered",
            CursorInner::Stream(_) => "stream",
            CursorInner::Closed => "closed",
        };
        write!(f, "Cursor({})", state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::FedError;

    #[tokio::test]
    async fn test_buffered_cursor_collects_in_order() {
        let cursor = Cursor::from_vec(vec![1, 2, 3]);
        assert!(!cursor.is_known_empty());
        assert_eq!(cursor.collect_all().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_empty_vec_is_known_empty() {
        let cursor: Cursor<u32> = Cursor::from_vec(Vec::new());
        assert!(cursor.is_known_empty());
    }

    #[tokio::test]
    async fn test_closed_cursor_yields_nothing() {
        let mut cursor = Cursor::from_stream(stream::iter(vec![Ok(1), Ok(2)]));
        cursor.close();
        assert!(cursor.is_closed());
        assert!(cursor.next().await.is_none());
    }

    #[tokio::test]
    async fn test_collect_stops_at_error() {
        let cursor = Cursor::from_stream(stream::iter(vec![
            Ok(1),
            Err(FedError::Timeout("late".to_string())),
            Ok(3),
        ]));
        match cursor.collect_all().await {
            Err(FedError::Timeout(msg)) => assert_eq!(msg, "late"),
            _ => panic!("Expected Timeout error"),
        }
    }

    #[tokio::test]
    async fn test_combinators() {
        let cursor = Cursor::from_vec(vec![1, 2, 2, 3, 4, 4, 5])
            .distinct()
            .filter_ok(|v| *v != 3)
            .map_ok(|v| v * 10)
            .slice(1, Some(2));
        assert_eq!(cursor.collect_all().await.unwrap(), vec![20, 40]);
    }

    #[tokio::test]
    async fn test_chain_all_skips_empty() {
        let cursor = Cursor::chain_all(vec![Cursor::empty(), Cursor::single(1), Cursor::from_vec(vec![2, 3])]);
        assert_eq!(cursor.collect_all().await.unwrap(), vec![1, 2, 3]);
    }
}
