//! Libvirt session wrapper: open a connection, query and mutate domains.
//!
//! All domain state lives inside libvirt; everything here is fetched
//! transiently per invocation.

use virt::connect::Connect;
use virt::domain::Domain;
use virt::error as virt_error;
use virt::sys;

use crate::domain_xml::{self, DiskInfo, InterfaceInfo};
use crate::error::VmlabError;

/// Domain lifecycle states, mapped from libvirt's numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomState {
    Running,
    Idle,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
    Unknown,
}

impl DomState {
    pub fn from_code(code: u32) -> Self {
        match code {
            sys::VIR_DOMAIN_RUNNING => DomState::Running,
            sys::VIR_DOMAIN_BLOCKED => DomState::Idle,
            sys::VIR_DOMAIN_PAUSED => DomState::Paused,
            sys::VIR_DOMAIN_SHUTDOWN => DomState::Shutdown,
            sys::VIR_DOMAIN_SHUTOFF => DomState::Shutoff,
            sys::VIR_DOMAIN_CRASHED => DomState::Crashed,
            sys::VIR_DOMAIN_PMSUSPENDED => DomState::PmSuspended,
            _ => DomState::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DomState::Running => "running",
            DomState::Idle => "idle",
            DomState::Paused => "paused",
            DomState::Shutdown => "shutdown",
            DomState::Shutoff => "shutoff",
            DomState::Crashed => "crashed",
            DomState::PmSuspended => "pmsuspended",
            DomState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DomState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `vm list`. Domains that error during query keep their
/// name and carry the error instead of failing the whole listing.
#[derive(Debug, Clone, facet::Facet)]
pub struct VmSummary {
    pub name: String,
    pub state: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub max_memory_mb: u64,
    pub error: Option<String>,
}

/// Detailed `vm info` output.
#[derive(Debug, Clone, facet::Facet)]
pub struct VmDetails {
    pub name: String,
    pub state: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub max_memory_mb: u64,
    pub cpu_time_secs: f64,
    pub disks: Vec<DiskInfo>,
    pub interfaces: Vec<InterfaceInfo>,
    pub ips: Vec<String>,
}

/// An open libvirt session. The connection closes on drop.
pub struct Hypervisor {
    conn: Connect,
    uri: String,
}

impl Drop for Hypervisor {
    fn drop(&mut self) {
        self.conn.close().ok();
    }
}

impl Hypervisor {
    /// Open a connection to the libvirt daemon.
    pub fn open(uri: &str) -> Result<Self, VmlabError> {
        // Suppress libvirt's default error handler, which prints to stderr.
        // Errors are surfaced only through Result values.
        virt_error::clear_error_callback();

        let conn = Connect::open(Some(uri)).map_err(|e| VmlabError::Libvirt {
            message: format!("failed to connect to libvirt: {e}"),
            hint: format!("ensure libvirtd is running and you have access to {uri}"),
        })?;
        Ok(Self {
            conn,
            uri: uri.to_string(),
        })
    }

    fn lookup(&self, name: &str) -> Result<Domain, VmlabError> {
        Domain::lookup_by_name(&self.conn, name)
            .map_err(|_| VmlabError::DomainNotFound { name: name.into() })
    }

    pub fn exists(&self, name: &str) -> bool {
        Domain::lookup_by_name(&self.conn, name).is_ok()
    }

    /// List every defined and running domain, sorted by name.
    pub fn list(&self) -> Result<Vec<VmSummary>, VmlabError> {
        let flags = sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
        let domains = self
            .conn
            .list_all_domains(flags)
            .map_err(|e| VmlabError::Libvirt {
                message: format!("failed to list domains: {e}"),
                hint: "check libvirt permissions".into(),
            })?;

        let mut vms = Vec::with_capacity(domains.len());
        for dom in domains {
            let name = dom.get_name().unwrap_or_else(|_| "?".into());
            match summarize(&dom, &name) {
                Ok(summary) => vms.push(summary),
                Err(e) => vms.push(VmSummary {
                    name,
                    state: "error".into(),
                    cpus: 0,
                    memory_mb: 0,
                    max_memory_mb: 0,
                    error: Some(e.to_string()),
                }),
            }
        }
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vms)
    }

    /// Detailed information about one domain, including devices parsed
    /// from its live XML.
    pub fn info(&self, name: &str) -> Result<VmDetails, VmlabError> {
        let dom = self.lookup(name)?;
        let info = dom.get_info().map_err(|e| VmlabError::Libvirt {
            message: format!("failed to query domain info: {e}"),
            hint: "check libvirt permissions".into(),
        })?;
        let state = DomState::from_code(info.state);
        let xml = self.xml_of(&dom)?;

        let ips = if is_running(&dom) {
            dom.interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
                .map(|ifaces| {
                    ifaces
                        .iter()
                        .flat_map(|i| i.addrs.iter().map(|a| a.addr.clone()))
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        Ok(VmDetails {
            name: name.into(),
            state: state.as_str().into(),
            cpus: info.nr_virt_cpu,
            memory_mb: info.memory / 1024,
            max_memory_mb: info.max_mem / 1024,
            cpu_time_secs: info.cpu_time as f64 / 1e9,
            disks: domain_xml::parse_disks(&xml),
            interfaces: domain_xml::parse_interfaces(&xml),
            ips,
        })
    }

    /// Define (not start) a new domain from XML.
    pub fn define(&self, xml: &str) -> Result<(), VmlabError> {
        Domain::define_xml(&self.conn, xml).map_err(|e| VmlabError::Libvirt {
            message: format!("failed to define domain: {e}"),
            hint: "check the generated domain XML for errors".into(),
        })?;
        Ok(())
    }

    /// Start a domain. Returns false when it was already running.
    ///
    /// Fixes permissions on file-backed disks first (best effort) so a
    /// previous root-owned qemu run doesn't block this one.
    pub fn start(&self, name: &str) -> Result<bool, VmlabError> {
        let dom = self.lookup(name)?;
        if is_running(&dom) {
            return Ok(false);
        }

        if let Ok(xml) = dom.get_xml_desc(0) {
            for disk in domain_xml::parse_disks(&xml) {
                let path = std::path::Path::new(&disk.source);
                if path.exists()
                    && let Err(e) = crate::disk::fix_permissions(path)
                {
                    tracing::debug!(path = %disk.source, "could not fix disk permissions: {e}");
                }
            }
        }

        dom.create().map_err(|e| VmlabError::Libvirt {
            message: format!("failed to start domain: {e}"),
            hint: format!("check `virsh -c {} start {name}` for details", self.uri),
        })?;
        tracing::info!(name, "domain started");
        Ok(true)
    }

    /// Stop a domain: ACPI shutdown, or destroy when `force` is set.
    /// Returns false when it was already stopped.
    pub fn stop(&self, name: &str, force: bool) -> Result<bool, VmlabError> {
        let dom = self.lookup(name)?;
        if !is_running(&dom) {
            return Ok(false);
        }
        if force {
            dom.destroy().map_err(|e| VmlabError::Libvirt {
                message: format!("force stop failed: {e}"),
                hint: "check libvirt permissions".into(),
            })?;
        } else {
            dom.shutdown().map_err(|e| VmlabError::Libvirt {
                message: format!("shutdown failed: {e}"),
                hint: "VM may not have ACPI support; retry with --force".into(),
            })?;
        }
        tracing::info!(name, force, "domain stop requested");
        Ok(true)
    }

    pub fn is_active(&self, name: &str) -> Result<bool, VmlabError> {
        Ok(is_running(&self.lookup(name)?))
    }

    /// Suspend a running domain. Returns false when it is not running.
    pub fn suspend(&self, name: &str) -> Result<bool, VmlabError> {
        let dom = self.lookup(name)?;
        if !is_running(&dom) {
            return Ok(false);
        }
        dom.suspend().map_err(|e| VmlabError::Libvirt {
            message: format!("failed to suspend domain: {e}"),
            hint: "check libvirt permissions".into(),
        })?;
        Ok(true)
    }

    /// Resume a paused domain. Returns false when it is not paused.
    pub fn resume(&self, name: &str) -> Result<bool, VmlabError> {
        let dom = self.lookup(name)?;
        let (state, _) = dom.get_state().map_err(|e| VmlabError::Libvirt {
            message: format!("failed to query domain state: {e}"),
            hint: "check libvirt permissions".into(),
        })?;
        if state != sys::VIR_DOMAIN_PAUSED {
            return Ok(false);
        }
        dom.resume().map_err(|e| VmlabError::Libvirt {
            message: format!("failed to resume domain: {e}"),
            hint: "check libvirt permissions".into(),
        })?;
        Ok(true)
    }

    /// Delete a domain: destroy when active, then undefine.
    pub fn delete(&self, name: &str) -> Result<(), VmlabError> {
        let dom = self.lookup(name)?;
        if is_running(&dom) {
            let _ = dom.destroy();
        }
        dom.undefine().map_err(|e| VmlabError::Libvirt {
            message: format!("failed to undefine domain: {e}"),
            hint: "check libvirt permissions".into(),
        })?;
        tracing::info!(name, "domain undefined");
        Ok(())
    }

    /// Set the vCPU count, live (when active) and in the persistent config.
    ///
    /// Raising the count above the configured maximum needs the domain
    /// XML rewritten first, and cannot take effect on a live domain —
    /// in that case the new maximum is persisted for next boot and a
    /// clear error tells the user to stop/set/start.
    pub fn set_vcpus(&self, name: &str, cpu: u32) -> Result<(), VmlabError> {
        let mut dom = self.lookup(name)?;
        let mut xml = self.xml_of(&dom)?;

        // placement='auto' (vcpu or numatune) needs numad; fix before anything else
        let mut normalized = domain_xml::normalize_vcpu_placement(&xml);
        if let Some(fixed) =
            domain_xml::normalize_numatune_placement(normalized.as_deref().unwrap_or(&xml))
        {
            normalized = Some(fixed);
        }
        if let Some(fixed) = normalized {
            dom = self.redefine(dom, &fixed)?;
            xml = self.xml_of(&dom)?;
            tracing::info!(name, "removed auto placement from domain config");
        }

        let max = domain_xml::max_vcpus(&xml).unwrap_or(0);
        if cpu > max {
            let active = is_running(&dom);
            if active {
                // Persist the raised maximum for next boot, then fail loudly:
                // the maximum of a live domain cannot be changed.
                let patched =
                    domain_xml::set_vcpu_element(&xml, cpu, max).ok_or(VmlabError::Libvirt {
                        message: "domain XML has no <vcpu> element".into(),
                        hint: "inspect the domain with `virsh dumpxml`".into(),
                    })?;
                self.redefine(dom, &patched)?;
                return Err(VmlabError::Libvirt {
                    message: format!(
                        "cannot raise vCPU count from {max} to {cpu} while '{name}' is running"
                    ),
                    hint: format!(
                        "the configuration was updated for next boot; run \
                         `vmlab vm stop {name}`, `vmlab vm set-cpu {name} {cpu}`, \
                         then `vmlab vm start {name}`"
                    ),
                });
            }
            let patched =
                domain_xml::set_vcpu_element(&xml, cpu, cpu).ok_or(VmlabError::Libvirt {
                    message: "domain XML has no <vcpu> element".into(),
                    hint: "inspect the domain with `virsh dumpxml`".into(),
                })?;
            dom = self.redefine(dom, &patched)?;
        }

        if is_running(&dom) {
            dom.set_vcpus_flags(cpu, sys::VIR_DOMAIN_AFFECT_LIVE)
                .map_err(|e| VmlabError::Libvirt {
                    message: format!("failed to set live vCPU count: {e}"),
                    hint: "check libvirt permissions".into(),
                })?;
        }
        dom.set_vcpus_flags(cpu, sys::VIR_DOMAIN_AFFECT_CONFIG)
            .map_err(|e| VmlabError::Libvirt {
                message: format!("failed to set configured vCPU count: {e}"),
                hint: "check libvirt permissions".into(),
            })?;
        tracing::info!(name, cpu, "vCPU count updated");
        Ok(())
    }

    /// Set memory in MB, live (when active) and in the persistent config.
    pub fn set_memory(&self, name: &str, memory_mb: u64) -> Result<(), VmlabError> {
        let dom = self.lookup(name)?;
        let memory_kib = memory_mb * 1024;
        if is_running(&dom) {
            dom.set_memory_flags(memory_kib, sys::VIR_DOMAIN_AFFECT_LIVE)
                .map_err(|e| VmlabError::Libvirt {
                    message: format!("failed to set live memory: {e}"),
                    hint: "the value may exceed the domain's maximum memory".into(),
                })?;
        }
        dom.set_memory_flags(memory_kib, sys::VIR_DOMAIN_AFFECT_CONFIG)
            .map_err(|e| VmlabError::Libvirt {
                message: format!("failed to set configured memory: {e}"),
                hint: "the value may exceed the domain's maximum memory".into(),
            })?;
        tracing::info!(name, memory_mb, "memory updated");
        Ok(())
    }

    /// The `virsh console` invocation for this domain, when it has a
    /// pty console configured.
    pub fn console_command(&self, name: &str) -> Result<Option<String>, VmlabError> {
        let dom = self.lookup(name)?;
        let xml = self.xml_of(&dom)?;
        if domain_xml::has_pty_console(&xml) {
            Ok(Some(format!("virsh -c {} console {name}", self.uri)))
        } else {
            Ok(None)
        }
    }

    /// Attach a cloud-init seed ISO as a CD-ROM in the persistent config.
    /// An already-attached seed CD-ROM gets its media swapped instead.
    pub fn attach_seed_iso(&self, name: &str, iso: &std::path::Path) -> Result<(), VmlabError> {
        let dom = self.lookup(name)?;
        let xml = self.xml_of(&dom)?;
        let cdrom = domain_xml::seed_cdrom_xml(iso);

        let result = if domain_xml::has_seed_cdrom(&xml) {
            dom.update_device_flags(&cdrom, sys::VIR_DOMAIN_DEVICE_MODIFY_CONFIG)
        } else {
            dom.attach_device_flags(&cdrom, sys::VIR_DOMAIN_AFFECT_CONFIG)
        };
        result.map_err(|e| VmlabError::Libvirt {
            message: format!("failed to attach seed ISO: {e}"),
            hint: "stop the VM before attaching a seed ISO".into(),
        })?;
        tracing::info!(name, iso = %iso.display(), "seed ISO attached");
        Ok(())
    }

    fn xml_of(&self, dom: &Domain) -> Result<String, VmlabError> {
        dom.get_xml_desc(0).map_err(|e| VmlabError::Libvirt {
            message: format!("failed to fetch domain XML: {e}"),
            hint: "check libvirt permissions".into(),
        })
    }

    /// Undefine + define with new XML, keeping NVRAM for active domains.
    fn redefine(&self, dom: Domain, xml: &str) -> Result<Domain, VmlabError> {
        let undefine = if is_running(&dom) {
            dom.undefine_flags(sys::VIR_DOMAIN_UNDEFINE_KEEP_NVRAM)
        } else {
            dom.undefine()
        };
        undefine.map_err(|e| VmlabError::Libvirt {
            message: format!("failed to undefine domain for redefinition: {e}"),
            hint: "check libvirt permissions".into(),
        })?;
        Domain::define_xml(&self.conn, xml).map_err(|e| VmlabError::Libvirt {
            message: format!("failed to redefine domain: {e}"),
            hint: "inspect the domain with `virsh dumpxml`".into(),
        })
    }
}

fn summarize(dom: &Domain, name: &str) -> Result<VmSummary, VmlabError> {
    let info = dom.get_info().map_err(|e| VmlabError::Libvirt {
        message: e.to_string(),
        hint: String::new(),
    })?;
    Ok(VmSummary {
        name: name.into(),
        state: DomState::from_code(info.state).as_str().into(),
        cpus: info.nr_virt_cpu,
        memory_mb: info.memory / 1024,
        max_memory_mb: info.max_mem / 1024,
        error: None,
    })
}

fn is_running(dom: &Domain) -> bool {
    dom.is_active().unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_map_to_names() {
        assert_eq!(DomState::from_code(sys::VIR_DOMAIN_RUNNING), DomState::Running);
        assert_eq!(DomState::from_code(sys::VIR_DOMAIN_BLOCKED), DomState::Idle);
        assert_eq!(DomState::from_code(sys::VIR_DOMAIN_PAUSED), DomState::Paused);
        assert_eq!(DomState::from_code(sys::VIR_DOMAIN_SHUTOFF), DomState::Shutoff);
        assert_eq!(DomState::from_code(sys::VIR_DOMAIN_CRASHED), DomState::Crashed);
        assert_eq!(
            DomState::from_code(sys::VIR_DOMAIN_PMSUSPENDED),
            DomState::PmSuspended
        );
        assert_eq!(DomState::from_code(9999), DomState::Unknown);
    }

    #[test]
    fn state_display_is_lowercase() {
        assert_eq!(DomState::Running.to_string(), "running");
        assert_eq!(DomState::PmSuspended.to_string(), "pmsuspended");
    }
}
