use std::thread;

/// Map `work` over `items` on up to `workers` scoped threads. Output order
/// matches input order regardless of which thread finished first.
pub(crate) fn fan_out<T, R, F>(items: &[T], workers: usize, work: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let workers = workers.max(1);
    if workers == 1 || items.len() < 2 {
        return items.iter().map(&work).collect();
    }

    let chunk_size = items.len().div_ceil(workers);
    thread::scope(|scope| {
        let work = &work;
        let handles = items
            .chunks(chunk_size)
            .map(|chunk| scope.spawn(move || chunk.iter().map(work).collect::<Vec<_>>()))
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .flat_map(|handle| match handle.join() {
                Ok(results) => results,
                Err(payload) => std::panic::resume_unwind(payload),
            })
            .collect()
    })
}
