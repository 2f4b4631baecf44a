//! Libvirt domain XML: generation for `vm create`, plus the small set of
//! read/patch helpers the CLI needs.
//!
//! The XML here is either produced by us or fetched straight back from
//! libvirt, so targeted string handling against libvirt's single-quoted
//! attribute style is sufficient — there is no foreign XML to defend
//! against.

use std::path::Path;

use crate::template::Template;

/// Generate libvirt domain XML for a new VM.
pub fn generate_domain_xml(
    name: &str,
    template: &Template,
    disk_path: &Path,
    cpu: u32,
    memory_mb: u64,
    network: &str,
) -> String {
    let os_type = &template.os_type;
    let arch = &template.arch;
    let boot_dev = &template.boot;
    let disk = disk_path.display();

    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{memory_mb}</memory>
  <currentMemory unit='MiB'>{memory_mb}</currentMemory>
  <vcpu placement='static'>{cpu}</vcpu>
  <os>
    <type arch='{arch}'>{os_type}</type>
    <boot dev='{boot_dev}'/>
  </os>
  <features>
    <acpi/>
    <apic/>
    <pae/>
  </features>
  <cpu mode='host-passthrough'/>
  <clock offset='utc'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>restart</on_crash>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <graphics type='vnc' port='-1' autoport='yes' listen='127.0.0.1'/>
    <video>
      <model type='cirrus' vram='9216' heads='1'/>
    </video>
  </devices>
</domain>
"#
    )
}

/// CD-ROM device XML for a cloud-init seed ISO.
pub fn seed_cdrom_xml(iso_path: &Path) -> String {
    let iso = iso_path.display();
    format!(
        r#"<disk type='file' device='cdrom'>
  <driver name='qemu' type='raw'/>
  <source file='{iso}'/>
  <target dev='hda' bus='ide'/>
  <readonly/>
</disk>"#
    )
}

/// A disk entry extracted from live domain XML.
#[derive(Debug, Clone, PartialEq, Eq, facet::Facet)]
pub struct DiskInfo {
    pub source: String,
    pub target: String,
    pub device: String,
}

/// A network interface entry extracted from live domain XML.
#[derive(Debug, Clone, PartialEq, Eq, facet::Facet)]
pub struct InterfaceInfo {
    pub mac: String,
    pub kind: String,
    pub source: String,
}

/// Extract a single-quoted attribute value from an XML fragment.
fn find_attr(fragment: &str, attr: &str) -> Option<String> {
    let needle = format!("{attr}='");
    let start = fragment.find(&needle)? + needle.len();
    let rest = &fragment[start..];
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}

/// Extract all file-backed disks (including CD-ROMs) from domain XML.
pub fn parse_disks(xml: &str) -> Vec<DiskInfo> {
    let mut disks = Vec::new();
    for part in xml.split("<disk ").skip(1) {
        let block = match part.find("</disk>") {
            Some(end) => &part[..end],
            None => continue,
        };
        let Some(source) = find_attr(block, "file") else {
            continue;
        };
        let Some(target) = find_attr(block, "dev") else {
            continue;
        };
        let device = find_attr(block, "device").unwrap_or_else(|| "disk".into());
        disks.push(DiskInfo {
            source,
            target,
            device,
        });
    }
    disks
}

/// Extract network interfaces from domain XML.
pub fn parse_interfaces(xml: &str) -> Vec<InterfaceInfo> {
    let mut interfaces = Vec::new();
    for part in xml.split("<interface ").skip(1) {
        let block = match part.find("</interface>") {
            Some(end) => &part[..end],
            None => continue,
        };
        let kind = find_attr(block, "type").unwrap_or_default();
        let Some(mac) = find_attr(block, "address") else {
            continue;
        };
        // NAT interfaces carry network='..' in <source>; bridged ones bridge='..'
        let source = find_attr(block, "network")
            .or_else(|| find_attr(block, "bridge"))
            .unwrap_or_default();
        interfaces.push(InterfaceInfo { mac, kind, source });
    }
    interfaces
}

/// Whether the domain already carries a cloud-init seed CD-ROM.
pub fn has_seed_cdrom(xml: &str) -> bool {
    xml.split("<disk ").skip(1).any(|part| {
        let block = part.find("</disk>").map(|end| &part[..end]).unwrap_or(part);
        find_attr(block, "device").as_deref() == Some("cdrom")
            && find_attr(block, "file").is_some_and(|f| f.ends_with("-seed.iso"))
    })
}

/// Whether the VM has a pty console configured.
pub fn has_pty_console(xml: &str) -> bool {
    xml.split("<console ")
        .skip(1)
        .any(|part| find_attr(part, "type").as_deref() == Some("pty"))
}

// ── vCPU element handling ───────────────────────────────────────────

/// The span of the `<vcpu ...>N</vcpu>` element in domain XML.
/// Matches the element open tag exactly, so `<vcpupin>` entries inside
/// `<cputune>` never shadow it.
fn vcpu_span(xml: &str) -> Option<(usize, usize)> {
    let start = match (xml.find("<vcpu>"), xml.find("<vcpu ")) {
        (Some(a), Some(b)) => a.min(b),
        (a, b) => a.or(b)?,
    };
    let end = xml[start..].find("</vcpu>")? + start + "</vcpu>".len();
    Some((start, end))
}

/// Maximum vCPU count: the text content of the `<vcpu>` element.
pub fn max_vcpus(xml: &str) -> Option<u32> {
    let (start, end) = vcpu_span(xml)?;
    let element = &xml[start..end];
    let text_start = element.find('>')? + 1;
    let text_end = element.rfind("</vcpu>")?;
    element[text_start..text_end].trim().parse().ok()
}

/// Rewrite `<vcpu placement='auto'>` to `placement='static'` — `auto`
/// requires numad, which is rarely installed on research machines.
/// Returns `None` when nothing needed fixing.
pub fn normalize_vcpu_placement(xml: &str) -> Option<String> {
    let (start, end) = vcpu_span(xml)?;
    let element = &xml[start..end];
    if find_attr(element, "placement").as_deref() != Some("auto") {
        return None;
    }
    let fixed = element.replace("placement='auto'", "placement='static'");
    Some(format!("{}{}{}", &xml[..start], fixed, &xml[end..]))
}

/// Strip `placement='auto'` from `<numatune><memory .../>` — it also
/// pulls in numad. The attribute is removed rather than set to static,
/// since static placement needs a nodeset we do not have.
/// Returns `None` when nothing needed fixing.
pub fn normalize_numatune_placement(xml: &str) -> Option<String> {
    let start = xml.find("<numatune>")?;
    let end = xml[start..].find("</numatune>")? + start;
    let block = &xml[start..end];
    if !block.contains("placement='auto'") {
        return None;
    }
    let fixed = block.replace(" placement='auto'", "");
    Some(format!("{}{}{}", &xml[..start], fixed, &xml[end..]))
}

/// Replace the `<vcpu>` element with a static-placement element carrying
/// the given maximum and current counts.
pub fn set_vcpu_element(xml: &str, max: u32, current: u32) -> Option<String> {
    let (start, end) = vcpu_span(xml)?;
    let element = format!("<vcpu placement='static' current='{current}'>{max}</vcpu>");
    Some(format!("{}{}{}", &xml[..start], element, &xml[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_template() -> Template {
        Template {
            name: "ubuntu-24.04".into(),
            os: "ubuntu".into(),
            version: "24.04".into(),
            ..Template::default()
        }
    }

    fn generated() -> String {
        generate_domain_xml(
            "test-vm",
            &test_template(),
            &PathBuf::from("/var/lib/vmlab/disks/test-vm.qcow2"),
            2,
            2048,
            "default",
        )
    }

    #[test]
    fn xml_contains_vm_name() {
        assert!(generated().contains("<name>test-vm</name>"));
    }

    #[test]
    fn xml_contains_resources() {
        let xml = generated();
        assert!(xml.contains("<memory unit='MiB'>2048</memory>"));
        assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
    }

    #[test]
    fn xml_contains_devices() {
        let xml = generated();
        assert!(xml.contains("source file='/var/lib/vmlab/disks/test-vm.qcow2'"));
        assert!(xml.contains("bus='virtio'"));
        assert!(xml.contains("<source network='default'/>"));
        assert!(xml.contains("<console type='pty'>"));
        assert!(xml.contains("type='vnc'"));
    }

    #[test]
    fn xml_uses_template_os_fields() {
        let mut template = test_template();
        template.arch = "aarch64".into();
        template.boot = "cdrom".into();
        let xml = generate_domain_xml(
            "arm-vm",
            &template,
            &PathBuf::from("/tmp/d.qcow2"),
            1,
            512,
            "default",
        );
        assert!(xml.contains("arch='aarch64'"));
        assert!(xml.contains("<boot dev='cdrom'/>"));
    }

    #[test]
    fn parse_disks_extracts_source_and_target() {
        let disks = parse_disks(&generated());
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].source, "/var/lib/vmlab/disks/test-vm.qcow2");
        assert_eq!(disks[0].target, "vda");
        assert_eq!(disks[0].device, "disk");
    }

    #[test]
    fn parse_disks_includes_cdrom() {
        let xml = format!(
            "<devices>{}</devices>",
            seed_cdrom_xml(&PathBuf::from("/tmp/vm-seed.iso"))
        );
        let disks = parse_disks(&xml);
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].device, "cdrom");
        assert_eq!(disks[0].target, "hda");
    }

    #[test]
    fn parse_interfaces_reads_mac_and_network() {
        let xml = r#"<devices>
          <interface type='network'>
            <mac address='52:54:00:aa:bb:cc'/>
            <source network='default'/>
            <model type='virtio'/>
          </interface>
        </devices>"#;
        let ifaces = parse_interfaces(xml);
        assert_eq!(ifaces.len(), 1);
        assert_eq!(ifaces[0].mac, "52:54:00:aa:bb:cc");
        assert_eq!(ifaces[0].kind, "network");
        assert_eq!(ifaces[0].source, "default");
    }

    #[test]
    fn parse_interfaces_falls_back_to_bridge() {
        let xml = r#"<interface type='bridge'>
          <mac address='52:54:00:11:22:33'/>
          <source bridge='br0'/>
        </interface>"#;
        let ifaces = parse_interfaces(xml);
        assert_eq!(ifaces[0].source, "br0");
    }

    #[test]
    fn seed_cdrom_detection() {
        assert!(!has_seed_cdrom(&generated()));
        let with_seed = format!(
            "{}{}",
            generated(),
            seed_cdrom_xml(&PathBuf::from("/var/lib/vmlab/disks/test-vm-seed.iso"))
        );
        assert!(has_seed_cdrom(&with_seed));
    }

    #[test]
    fn pty_console_detection() {
        assert!(has_pty_console(&generated()));
        assert!(!has_pty_console("<domain><devices/></domain>"));
    }

    #[test]
    fn max_vcpus_reads_element_text() {
        assert_eq!(max_vcpus(&generated()), Some(2));
        assert_eq!(max_vcpus("<vcpu placement='auto'>8</vcpu>"), Some(8));
        assert_eq!(max_vcpus("<vcpu>3</vcpu>"), Some(3));
        assert_eq!(max_vcpus("<domain/>"), None);
    }

    #[test]
    fn vcpupin_entries_do_not_shadow_the_vcpu_element() {
        let xml = "<domain>\
                   <cputune><vcpupin vcpu='0' cpuset='1'/></cputune>\
                   <vcpu placement='static'>4</vcpu>\
                   </domain>";
        assert_eq!(max_vcpus(xml), Some(4));
        let patched = set_vcpu_element(xml, 8, 4).unwrap();
        assert!(patched.contains("<vcpupin vcpu='0' cpuset='1'/>"));
        assert!(patched.contains("<vcpu placement='static' current='4'>8</vcpu>"));
    }

    #[test]
    fn normalize_placement_fixes_auto() {
        let xml = "<domain><vcpu placement='auto'>4</vcpu></domain>";
        let fixed = normalize_vcpu_placement(xml).unwrap();
        assert!(fixed.contains("<vcpu placement='static'>4</vcpu>"));
    }

    #[test]
    fn normalize_placement_leaves_static_alone() {
        assert!(normalize_vcpu_placement(&generated()).is_none());
    }

    #[test]
    fn normalize_numatune_strips_auto_placement() {
        let xml = "<domain>\
                   <vcpu placement='static'>2</vcpu>\
                   <numatune><memory mode='strict' placement='auto'/></numatune>\
                   </domain>";
        let fixed = normalize_numatune_placement(xml).unwrap();
        assert!(fixed.contains("<memory mode='strict'/>"));
        assert!(!fixed.contains("placement='auto'"));
        // The vcpu element is untouched
        assert!(fixed.contains("<vcpu placement='static'>2</vcpu>"));
    }

    #[test]
    fn normalize_numatune_leaves_clean_config_alone() {
        assert!(normalize_numatune_placement(&generated()).is_none());
        let nodeset = "<domain><numatune><memory mode='strict' nodeset='0'/></numatune></domain>";
        assert!(normalize_numatune_placement(nodeset).is_none());
    }

    #[test]
    fn set_vcpu_element_rewrites_max_and_current() {
        let xml = "<domain><vcpu placement='auto'>2</vcpu></domain>";
        let patched = set_vcpu_element(xml, 8, 2).unwrap();
        assert!(patched.contains("<vcpu placement='static' current='2'>8</vcpu>"));
        assert_eq!(max_vcpus(&patched), Some(8));
    }
}
