use nimbus_core::filter::sort_field;
use nimbus_core::{NimbusResult, ResourceKind, ResourceRecord, SortDirection, ORDER_IN_FILTERED_RESULT};

/// Stable sort by a declared numeric field, then rank each record 1..N.
pub fn sort_records(
    kind: ResourceKind,
    mut list: Vec<ResourceRecord>,
    order_by: &str,
    direction: &str,
) -> NimbusResult<Vec<ResourceRecord>> {
    let field = sort_field(kind, order_by)?;
    let dir = SortDirection::parse(direction)?;
    list.sort_by(|a, b| {
        let ord = a.num_attr(field).total_cmp(&b.num_attr(field));
        match dir {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        }
    });
    for (i, rec) in list.iter_mut().enumerate() {
        rec.set(ORDER_IN_FILTERED_RESULT, (i + 1) as u64);
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, vcpu: u64, mem: f64) -> ResourceRecord {
        let mut r = ResourceRecord::new(ResourceKind::Spec, id).with("vCPU", vcpu).with("memoryGiB", mem);
        r.id = id.into();
        r
    }

    #[test]
    fn ascending_vcpu_is_non_decreasing_and_ranked() {
        let list = vec![spec("c", 8, 32.0), spec("a", 2, 4.0), spec("b", 4, 16.0), spec("d", 2, 8.0)];
        let out = sort_records(ResourceKind::Spec, list, "vCPU", "ascending").unwrap();
        let vcpus: Vec<f64> = out.iter().map(|r| r.num_attr("vCPU")).collect();
        assert!(vcpus.windows(2).all(|w| w[0] <= w[1]));
        let ranks: Vec<u64> = out.iter().filter_map(|r| r.order_in_filtered_result()).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
        // ties keep input order
        assert_eq!(out[0].id, "a");
        assert_eq!(out[1].id, "d");
    }

    #[test]
    fn descending_memory() {
        let list = vec![spec("a", 2, 4.0), spec("b", 4, 16.0), spec("c", 8, 8.0)];
        let out = sort_records(ResourceKind::Spec, list, "memoryGiB", "descending").unwrap();
        let ids: Vec<&str> = out.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn bad_direction_or_field_is_invalid_argument() {
        let list = vec![spec("a", 2, 4.0)];
        let e = sort_records(ResourceKind::Spec, list.clone(), "vCPU", "up").unwrap_err();
        assert!(matches!(e, nimbus_core::Error::InvalidArgument(_)));
        let e = sort_records(ResourceKind::Spec, list, "flavour", "ascending").unwrap_err();
        assert!(matches!(e, nimbus_core::Error::InvalidArgument(_)));
    }
}
