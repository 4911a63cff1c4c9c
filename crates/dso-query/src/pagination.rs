//! Page-number pagination without counting.
//!
//! A page asks the backend for one record more than it shows. That extra
//! "sentinel" record is never handed out; its presence only tells whether a
//! next page exists. The answer is known once the page has been consumed.

use crate::config::{ParamNames, QueryConfig};
use crate::error::{QueryError, Result};
use crate::params::QueryParams;
use crate::predicate::QueryBuilder;
use crate::traits::{QueryExecutor, RecordStream};
use async_stream::stream;
use futures::StreamExt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PageState {
    /// Waiting for the first record
    Fetching,
    /// Records are being handed out
    Counting,
    Ready { has_next: bool },
}

/// Shared view on the progress of a page, readable while its stream is consumed elsewhere
#[derive(Debug, Clone)]
pub struct PageProgress(Arc<AtomicU8>);

impl PageProgress {
    const FETCHING: u8 = 0;
    const COUNTING: u8 = 1;
    const LAST: u8 = 2;
    const HAS_NEXT: u8 = 3;

    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(Self::FETCHING)))
    }

    fn set(&self, state: PageState) {
        let value = match state {
            PageState::Fetching => Self::FETCHING,
            PageState::Counting => Self::COUNTING,
            PageState::Ready { has_next: false } => Self::LAST,
            PageState::Ready { has_next: true } => Self::HAS_NEXT,
        };
        self.0.store(value, Ordering::Release);
    }

    pub fn state(&self) -> PageState {
        match self.0.load(Ordering::Acquire) {
            Self::FETCHING => PageState::Fetching,
            Self::COUNTING => PageState::Counting,
            Self::LAST => PageState::Ready { has_next: false },
            _ => PageState::Ready { has_next: true },
        }
    }

    /// `None` until the page has been consumed completely
    pub fn has_next(&self) -> Option<bool> {
        match self.state() {
            PageState::Ready { has_next } => Some(has_next),
            _ => None,
        }
    }
}

/// One page of records
pub struct ObjectPage {
    pub number: usize,
    pub page_size: usize,
    progress: PageProgress,
    items: Option<RecordStream>,
}

impl ObjectPage {
    fn empty(number: usize, page_size: usize) -> Self {
        let progress = PageProgress::new();
        progress.set(PageState::Ready { has_next: false });
        Self {
            number,
            page_size,
            progress,
            items: Some(futures::stream::empty().boxed()),
        }
    }

    pub fn state(&self) -> PageState {
        self.progress.state()
    }

    pub fn has_next(&self) -> Option<bool> {
        self.progress.has_next()
    }

    pub fn progress(&self) -> PageProgress {
        self.progress.clone()
    }

    /// The record stream of this page; `None` once taken
    pub fn take_items(&mut self) -> Option<RecordStream> {
        self.items.take()
    }

    /// Wrap the record stream, e.g. to observe the records as they pass
    pub fn map_items<F>(mut self, wrap: F) -> Self
    where
        F: FnOnce(RecordStream) -> RecordStream,
    {
        self.items = self.items.take().map(wrap);
        self
    }
}

/// Fetches numbered pages of a query
#[derive(Debug, Clone, Copy)]
pub struct Paginator {
    page_number: usize,
    page_size: usize,
    offset: usize,
}

impl Paginator {
    /// Errors name the parameters as configured in `names`.
    ///
    /// A page whose offset does not fit in `usize` lies beyond any data and
    /// is `NotFound`.
    pub fn new(page_number: usize, page_size: usize, names: &ParamNames) -> Result<Self> {
        if page_number < 1 {
            return Err(QueryError::validation(&names.page, "page numbers start at 1"));
        }
        if page_size < 1 {
            return Err(QueryError::validation(&names.page_size, "page size must be at least 1"));
        }
        let offset = (page_number - 1)
            .checked_mul(page_size)
            .filter(|_| page_size.checked_add(1).is_some())
            .ok_or_else(|| QueryError::not_found(format!("page {} does not exist", page_number)))?;
        Ok(Self {
            page_number,
            page_size,
            offset,
        })
    }

    /// Page number and size as given by the request parameters
    pub fn from_params(params: &QueryParams, config: &QueryConfig) -> Result<Self> {
        Self::new(
            parse_page_number(params, config)?,
            parse_page_size(params, config)?,
            &config.params,
        )
    }

    pub fn page_number(&self) -> usize {
        self.page_number
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Run the query for this page.
    ///
    /// Only the first record is awaited here, to tell an empty page apart;
    /// everything else is pulled by the consumer of the returned page.
    pub async fn get_page(
        &self,
        executor: &dyn QueryExecutor,
        builder: QueryBuilder,
    ) -> Result<ObjectPage> {
        let (number, size) = (self.page_number, self.page_size);
        let query = builder
            .offset(self.offset)
            .limit(size + 1)
            .build();
        debug!(
            "Fetching page {} of {} (offset {}, limit {})",
            number, query.table.key, query.offset, size + 1
        );

        let progress = PageProgress::new();
        let mut upstream = executor.execute(query).await?;
        let first = match upstream.next().await {
            None if number > 1 => {
                return Err(QueryError::not_found(format!("page {} does not exist", number)));
            }
            None => return Ok(ObjectPage::empty(number, size)),
            Some(Err(e)) => return Err(e),
            Some(Ok(record)) => record,
        };
        progress.set(PageState::Counting);

        let counter = progress.clone();
        let items = stream! {
            let mut handed_out = 1;
            yield Ok(first);
            loop {
                match upstream.next().await {
                    None => {
                        counter.set(PageState::Ready { has_next: false });
                        break;
                    }
                    Some(Err(e)) => {
                        yield Err(e);
                        break;
                    }
                    Some(Ok(_)) if handed_out == size => {
                        counter.set(PageState::Ready { has_next: true });
                        break;
                    }
                    Some(Ok(record)) => {
                        handed_out += 1;
                        yield Ok(record);
                    }
                }
            }
        };

        Ok(ObjectPage {
            number,
            page_size: size,
            progress,
            items: Some(items.boxed()),
        })
    }
}

/// Requested page number: 1 when absent or not a number, an error below 1
pub fn parse_page_number(params: &QueryParams, config: &QueryConfig) -> Result<usize> {
    let name = config.params.page.as_str();
    let Some(raw) = params.get(name) else {
        return Ok(1);
    };
    match raw.trim().parse::<i64>() {
        Ok(number) if number < 1 => Err(QueryError::validation(
            name,
            format!("page numbers start at 1, got {}", number),
        )),
        Ok(number) => Ok(usize::try_from(number).unwrap_or(usize::MAX)),
        Err(_) => {
            debug!("Ignoring non-numeric page number '{}'", raw);
            Ok(1)
        }
    }
}

/// Requested page size, limited to the configured maximum
pub fn parse_page_size(params: &QueryParams, config: &QueryConfig) -> Result<usize> {
    let name = config.params.page_size.as_str();
    let Some(raw) = params.get(name) else {
        return Ok(config.default_page_size);
    };
    match raw.trim().parse::<i64>() {
        Ok(size) if size >= 1 => Ok(usize::try_from(size)
            .unwrap_or(usize::MAX)
            .min(config.max_page_size)),
        _ => Err(QueryError::validation(
            name,
            format!("'{}' is not a valid page size", raw),
        )),
    }
}
