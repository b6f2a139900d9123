//! Pagination and locality helpers shared by the client implementations.

use std::future::Future;

use uuid::Uuid;

use super::errors::Error;
use super::types::{Region, Zone};

/// Maximum page size accepted by the Block API list endpoints.
pub(crate) const MAX_PAGE_SIZE: u32 = 50;

/// Lists resources with absolute `start`/`max` pagination on top of the API's
/// page-number pagination. `max == 0` means unlimited. The returned token is
/// the decimal offset of the next element that was not returned, present only
/// when more results may exist.
pub(crate) async fn paginated_list<T, F, Fut>(
    mut query: F,
    start: u32,
    max: u32,
) -> Result<(Vec<T>, Option<String>), Error>
where
    F: FnMut(i32, u32) -> Fut,
    Fut: Future<Output = Result<Vec<T>, Error>>,
{
    let page_size = if max != 0 && max < MAX_PAGE_SIZE {
        max
    } else {
        MAX_PAGE_SIZE
    };

    // First page to query (page numbers start at 1) and index of the first
    // element of interest within it.
    let mut page = (start / page_size) as i32 + 1;
    let mut first = (start % page_size) as usize;

    let mut elements: Vec<T> = Vec::new();

    loop {
        let resp = query(page, page_size).await?;
        let resp_count = resp.len();

        if first >= resp_count {
            return Ok((elements, None));
        }

        if max == 0 {
            elements.extend(resp.into_iter().skip(first));
        } else {
            let upper = resp_count.min(first + (max as usize - elements.len()));
            elements.extend(resp.into_iter().take(upper).skip(first));

            // Reached max elements.
            if elements.len() >= max as usize {
                let next = (resp_count == page_size as usize).then(|| (start + max).to_string());
                return Ok((elements, next));
            }
        }

        // Less results than page size, so this was the last page.
        if resp_count != page_size as usize {
            return Ok((elements, None));
        }

        first = 0;
        page += 1;
    }
}

/// Returns the zones of the region where the client is configured, together
/// with the zone used when a request does not specify one.
pub(crate) fn client_zones(
    default_zone: Option<Zone>,
    default_region: Option<Region>,
) -> Result<(Zone, Vec<Zone>), Error> {
    if let Some(zone) = default_zone {
        return Ok((zone, zone.region().zones()));
    }

    if let Some(region) = default_region {
        let zones = region.zones();
        if let Some(first) = zones.first() {
            return Ok((*first, zones));
        }
    }

    Err(Error::NoZoneConfigured)
}

/// Returns true if the provided value is a well-formed UUID.
pub(crate) fn is_valid_uuid(value: &str) -> bool {
    Uuid::parse_str(value).is_ok()
}

/// Synthesizes a not-found error for IDs that are not well-formed UUIDs so
/// that trivially bad input never reaches the API.
pub(crate) fn check_uuid(value: &str, resource: &'static str) -> Result<(), Error> {
    if is_valid_uuid(value) {
        Ok(())
    } else {
        Err(Error::NotFound {
            resource,
            id: value.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serves `backing` through the (page, page_size) interface of the API.
    fn pages_of(backing: Vec<u32>) -> impl FnMut(i32, u32) -> std::future::Ready<Result<Vec<u32>, Error>>
    {
        move |page, page_size| {
            let from = ((page - 1) as usize) * page_size as usize;
            let to = (from + page_size as usize).min(backing.len());
            let slice = if from >= backing.len() {
                Vec::new()
            } else {
                backing[from..to].to_vec()
            };
            std::future::ready(Ok(slice))
        }
    }

    #[tokio::test]
    async fn unlimited_list_returns_tail_without_token() {
        let backing: Vec<u32> = (0..120).collect();
        let (items, next) = paginated_list(pages_of(backing.clone()), 7, 0)
            .await
            .expect("list");
        assert_eq!(items, backing[7..].to_vec());
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn bounded_list_returns_window_and_token() {
        let backing: Vec<u32> = (0..120).collect();
        let (items, next) = paginated_list(pages_of(backing.clone()), 10, 25)
            .await
            .expect("list");
        assert_eq!(items, backing[10..35].to_vec());
        assert_eq!(next.as_deref(), Some("35"));
    }

    #[tokio::test]
    async fn token_walk_recovers_backing_list() {
        let backing: Vec<u32> = (0..103).collect();
        for start in [0_u32, 1, 49, 50, 51, 99] {
            for max in [1_u32, 3, 50, 60] {
                let mut collected = Vec::new();
                let mut cursor = start;
                loop {
                    let (items, next) = paginated_list(pages_of(backing.clone()), cursor, max)
                        .await
                        .expect("list");
                    collected.extend(items);
                    match next {
                        Some(token) => cursor = token.parse().expect("numeric token"),
                        None => break,
                    }
                }
                assert_eq!(
                    collected,
                    backing[start as usize..].to_vec(),
                    "start={start} max={max}"
                );
            }
        }
    }

    #[tokio::test]
    async fn start_past_the_end_returns_nothing() {
        let backing: Vec<u32> = (0..10).collect();
        let (items, next) = paginated_list(pages_of(backing), 10, 5).await.expect("list");
        assert!(items.is_empty());
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn exact_page_boundary_emits_token_only_when_more_may_exist() {
        // 50 elements, ask for exactly the first 50: the page was full so a
        // token is emitted; following it yields nothing.
        let backing: Vec<u32> = (0..50).collect();
        let (items, next) = paginated_list(pages_of(backing.clone()), 0, 50)
            .await
            .expect("list");
        assert_eq!(items.len(), 50);
        assert_eq!(next.as_deref(), Some("50"));
        let (rest, next) = paginated_list(pages_of(backing), 50, 50).await.expect("list");
        assert!(rest.is_empty());
        assert!(next.is_none());
    }

    #[test]
    fn client_zones_prefers_default_zone_region() {
        let (default, zones) = client_zones(Some(Zone::NlAms2), None).expect("zones");
        assert_eq!(default, Zone::NlAms2);
        assert_eq!(zones, Region::NlAms.zones());
    }

    #[test]
    fn client_zones_falls_back_to_region() {
        let (default, zones) = client_zones(None, Some(Region::PlWaw)).expect("zones");
        assert_eq!(default, Zone::PlWaw1);
        assert_eq!(zones, Region::PlWaw.zones());
    }

    #[test]
    fn client_zones_requires_some_locality() {
        assert!(matches!(
            client_zones(None, None),
            Err(Error::NoZoneConfigured)
        ));
    }

    #[test]
    fn uuid_precheck() {
        assert!(is_valid_uuid("11111111-1111-1111-1111-111111111111"));
        assert!(!is_valid_uuid("not-a-uuid"));
        assert!(check_uuid("not-a-uuid", "volume").is_err());
    }
}
