use fanin_queue::Endpoint;

/// Picks the endpoints worker `worker_index` of `worker_count` polls.
///
/// With fewer workers than endpoints every worker polls every endpoint, so none is left
/// unpolled. Otherwise each worker owns exactly one, `endpoints[worker_index % len]`, and
/// surplus workers share endpoints.
pub fn assign(endpoints: &[Endpoint], worker_count: usize, worker_index: usize) -> Vec<Endpoint> {
    if endpoints.is_empty() {
        return vec![];
    }
    if worker_count < endpoints.len() {
        return endpoints.to_vec();
    }
    endpoints
        .get(worker_index % endpoints.len())
        .cloned()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(n: u16) -> Vec<Endpoint> {
        (0..n).map(|i| Endpoint::new(format!("q{i}"), 2229)).collect()
    }

    #[test]
    fn test_fewer_workers_poll_everything() {
        let eps = endpoints(3);
        for worker in 0..2 {
            assert_eq!(assign(&eps, 2, worker), eps);
        }
    }

    #[test]
    fn test_one_endpoint_per_worker() {
        let eps = endpoints(3);
        let owned: Vec<Vec<Endpoint>> = (0..3).map(|w| assign(&eps, 3, w)).collect();
        assert_eq!(
            owned,
            vec![
                vec![eps[0].clone()],
                vec![eps[1].clone()],
                vec![eps[2].clone()]
            ]
        );
    }

    #[test]
    fn test_surplus_workers_wrap_around() {
        let eps = endpoints(2);
        let owned: Vec<Endpoint> = (0..5).flat_map(|w| assign(&eps, 5, w)).collect();
        assert_eq!(
            owned,
            vec![
                eps[0].clone(),
                eps[1].clone(),
                eps[0].clone(),
                eps[1].clone(),
                eps[0].clone()
            ]
        );
    }

    #[test]
    fn test_no_endpoints() {
        assert!(assign(&[], 4, 1).is_empty());
    }
}
