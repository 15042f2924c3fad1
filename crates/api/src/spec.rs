//! VM spec catalog: lookups against the driver and registration of specs
//! into the registry, one at a time or in bulk per connection.

use std::time::Instant;

use nimbus_core::identity::{check_string, to_naming_rule_compatible};
use nimbus_core::{Error, FilterCriteria, NimbusResult, ResourceKind, ResourceRecord};
use nimbus_driver::model::{ConnectionConfigList, VmSpecInfo, VmSpecList};
use nimbus_driver::{DriverGateway, Operation};
use nimbus_registry::Registry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecReq {
    pub name: String,
    pub connection_name: String,
    pub csp_spec_name: String,
    #[serde(default)]
    pub description: String,
}

/// Translate a driver spec into a registry record. `VCpu.Count` becomes an
/// integer `vCPU`; `Mem` (MiB) becomes `memoryGiB`. Unparsable numbers read as zero.
pub fn convert_driver_spec(spec: &VmSpecInfo) -> NimbusResult<ResourceRecord> {
    if spec.name.is_empty() {
        return Err(Error::invalid("driver spec has an empty name"));
    }
    let vcpu = spec.vcpu.count.trim().parse::<u64>().unwrap_or(0);
    let mem_mib = spec.mem.trim().parse::<f64>().unwrap_or(0.0);
    Ok(ResourceRecord::new(ResourceKind::Spec, &spec.name)
        .with("cspSpecName", spec.name.clone())
        .with("regionName", spec.region.clone())
        .with("vCPU", vcpu)
        .with("memoryGiB", mem_mib / 1024.0))
}

#[derive(Clone)]
pub struct SpecService {
    registry: Registry,
    driver: DriverGateway,
}

impl SpecService {
    pub fn new(registry: Registry, driver: DriverGateway) -> Self {
        Self { registry, driver }
    }

    pub async fn lookup(&self, connection_name: &str, csp_spec_name: &str) -> NimbusResult<VmSpecInfo> {
        if connection_name.is_empty() || csp_spec_name.is_empty() {
            return Err(Error::invalid("connection name and CSP spec name are required"));
        }
        let op = Operation::GetVmSpec { name: csp_spec_name.to_string() };
        Ok(self.driver.invoke_as(op, connection_name, Value::Null).await?)
    }

    pub async fn lookup_list(&self, connection_name: &str) -> NimbusResult<VmSpecList> {
        if connection_name.is_empty() {
            return Err(Error::invalid("connection name is required"));
        }
        Ok(self.driver.invoke_as(Operation::ListVmSpecs, connection_name, Value::Null).await?)
    }

    /// Look the spec up on the driver and record it under `req.name`.
    /// With `update`, an existing record is overwritten.
    pub async fn register_with_csp_spec_name(
        &self,
        namespace: &str,
        req: &SpecReq,
        update: bool,
    ) -> NimbusResult<ResourceRecord> {
        check_string(namespace)?;
        check_string(&req.name)?;
        if !update && self.registry.exists(namespace, ResourceKind::Spec, &req.name).await? {
            return Err(Error::already_exists(namespace, ResourceKind::Spec, &req.name));
        }
        let found = self.lookup(&req.connection_name, &req.csp_spec_name).await?;
        let mut rec = convert_driver_spec(&found)?;
        rec.id = req.name.clone();
        rec.name = req.name.clone();
        rec.connection_name = req.connection_name.clone();
        rec.description = req.description.clone();
        self.registry.upsert(namespace, ResourceKind::Spec, rec).await
    }

    /// Record a fully described spec; its id is its name.
    pub async fn register_with_info(
        &self,
        namespace: &str,
        mut rec: ResourceRecord,
        update: bool,
    ) -> NimbusResult<ResourceRecord> {
        check_string(namespace)?;
        check_string(&rec.name)?;
        rec.id = rec.name.clone();
        if !update && self.registry.exists(namespace, ResourceKind::Spec, &rec.id).await? {
            return Err(Error::already_exists(namespace, ResourceKind::Spec, &rec.id));
        }
        self.registry.upsert(namespace, ResourceKind::Spec, rec).await
    }

    /// Register every spec the driver offers on `connection_name`, keyed
    /// `<connection>-<canonical name>`. Ids already present, or whose presence
    /// cannot be checked, are left alone. Returns how many were registered.
    pub async fn fetch_for_connection(&self, namespace: &str, connection_name: &str) -> NimbusResult<usize> {
        let t0 = Instant::now();
        check_string(namespace)?;
        let list = self.lookup_list(connection_name).await?;
        let mut count = 0usize;
        for spec in &list.vmspec {
            let mut rec = convert_driver_spec(spec)?;
            let id = to_naming_rule_compatible(&format!("{}-{}", connection_name, spec.name))?;
            match self.registry.exists(namespace, ResourceKind::Spec, &id).await {
                Ok(true) => {
                    debug!(ns = %namespace, id = %id, "spec: already registered; skipped");
                    continue;
                }
                Err(e) => {
                    warn!(ns = %namespace, id = %id, error = %e, "spec: existence check failed; skipped");
                    continue;
                }
                Ok(false) => {}
            }
            rec.name = id;
            rec.connection_name = connection_name.to_string();
            self.register_with_info(namespace, rec, true).await?;
            count += 1;
        }
        info!(ns = %namespace, conn = %connection_name, offered = list.vmspec.len(), registered = count, took_ms = %t0.elapsed().as_millis(), "spec: fetch ok");
        Ok(count)
    }

    /// [`SpecService::fetch_for_connection`] over every connection the driver
    /// knows. A failing connection contributes zero specs. Returns
    /// `(connections, specs)`.
    pub async fn fetch_for_all_connections(&self, namespace: &str) -> NimbusResult<(usize, usize)> {
        check_string(namespace)?;
        let conns: ConnectionConfigList =
            self.driver.invoke_as(Operation::ListConnectionConfigs, "", Value::Null).await?;
        let mut specs = 0usize;
        for conn in &conns.connectionconfig {
            match self.fetch_for_connection(namespace, &conn.config_name).await {
                Ok(n) => specs += n,
                Err(e) => warn!(ns = %namespace, conn = %conn.config_name, error = %e, "spec: fetch for connection failed"),
            }
        }
        Ok((conns.connectionconfig.len(), specs))
    }

    pub async fn filter(&self, namespace: &str, criteria: &FilterCriteria) -> NimbusResult<Vec<ResourceRecord>> {
        self.registry.filter_by_range(namespace, ResourceKind::Spec, criteria).await
    }

    /// Filter, then rank by `order_by` in `direction`.
    pub async fn filter_sorted(
        &self,
        namespace: &str,
        criteria: &FilterCriteria,
        order_by: &str,
        direction: &str,
    ) -> NimbusResult<Vec<ResourceRecord>> {
        let hits = self.filter(namespace, criteria).await?;
        self.registry.sort(ResourceKind::Spec, hits, order_by, direction)
    }

    pub async fn update(&self, namespace: &str, id: &str, partial: &Map<String, Value>) -> NimbusResult<ResourceRecord> {
        self.registry.update(namespace, ResourceKind::Spec, id, partial).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_driver::model::VCpu;

    #[test]
    fn driver_spec_conversion() {
        let spec = VmSpecInfo {
            region: "us-east-1".into(),
            name: "t3.large".into(),
            vcpu: VCpu { count: "2".into(), clock: "3.1".into() },
            mem: "8192".into(),
            ..Default::default()
        };
        let rec = convert_driver_spec(&spec).unwrap();
        assert_eq!(rec.name, "t3.large");
        assert_eq!(rec.attr("vCPU"), Some(Value::from(2u64)));
        assert_eq!(rec.num_attr("memoryGiB"), 8.0);
        assert_eq!(rec.str_attr("regionName").as_deref(), Some("us-east-1"));
    }

    #[test]
    fn bad_numbers_read_as_zero_and_empty_name_fails() {
        let spec = VmSpecInfo { name: "x".into(), vcpu: VCpu { count: "two".into(), ..Default::default() }, ..Default::default() };
        let rec = convert_driver_spec(&spec).unwrap();
        assert_eq!(rec.num_attr("vCPU"), 0.0);
        assert_eq!(rec.num_attr("memoryGiB"), 0.0);
        assert!(matches!(convert_driver_spec(&VmSpecInfo::default()), Err(Error::InvalidArgument(_))));
    }
}
