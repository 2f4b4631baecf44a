use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing_subscriber::EnvFilter;

use vmlab::cli::{Cli, Command, ImageCommand, TemplateCommand, VmCommand};
use vmlab::cloudinit;
use vmlab::disk;
use vmlab::domain_xml::{self, InterfaceInfo};
use vmlab::error::VmlabError;
use vmlab::hypervisor::{Hypervisor, VmSummary};
use vmlab::image;
use vmlab::paths;
use vmlab::settings::{self, Settings};
use vmlab::template::{Template, TemplateStore};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("vmlab=debug")
    } else {
        EnvFilter::from_default_env().add_directive("vmlab=info".parse().expect("valid directive"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_dir = cli.config_dir.clone().unwrap_or_else(paths::config_dir);
    let settings = settings::load_settings(&config_dir)?;

    match cli.command {
        Command::Init => run_init(&config_dir, &settings)?,
        Command::Template { action } => run_template(&config_dir, action)?,
        Command::Image { action } => {
            let cache_dir = settings.cache_dir();
            match action {
                ImageCommand::List => image::list_cached(&cache_dir)?,
                ImageCommand::Delete { name } => image::delete_cached(&cache_dir, &name)?,
                ImageCommand::Clear => image::clear_cache(&cache_dir)?,
            }
        }
        Command::Vm { action } => run_vm(&config_dir, &settings, action).await?,
    }

    Ok(())
}

const SETTINGS_TEMPLATE: &str = r#"# vmlab settings
# libvirt_uri = "qemu:///system"
# storage_dir = "/var/lib/vmlab/disks"
# cache_dir = "/var/cache/vmlab/images"
"#;

fn run_init(config_dir: &Path, settings: &Settings) -> Result<(), VmlabError> {
    for dir in [
        config_dir.to_path_buf(),
        settings.storage_dir(),
        settings.cache_dir(),
    ] {
        std::fs::create_dir_all(&dir).map_err(|e| VmlabError::Io {
            context: format!("creating directory {}", dir.display()),
            source: e,
        })?;
    }

    let settings_file = paths::settings_file(config_dir);
    if !settings_file.exists() {
        std::fs::write(&settings_file, SETTINGS_TEMPLATE).map_err(|e| VmlabError::Io {
            context: format!("writing {}", settings_file.display()),
            source: e,
        })?;
    }

    let mut store = TemplateStore::open(&paths::templates_dir(config_dir))?;
    store.write_defaults()?;

    println!("Initialized vmlab in {}", config_dir.display());
    println!("  templates: {}", store.list().len());
    println!("  settings:  {}", settings_file.display());
    println!("\nRun `vmlab template list` to see available templates.");
    Ok(())
}

#[derive(Tabled)]
struct TemplateRow {
    name: String,
    os: String,
    version: String,
    arch: String,
    #[tabled(rename = "cloud image")]
    cloud_image: &'static str,
    description: String,
}

fn run_template(config_dir: &Path, action: TemplateCommand) -> Result<(), VmlabError> {
    let mut store = TemplateStore::open(&paths::templates_dir(config_dir))?;
    match action {
        TemplateCommand::List { json } => {
            let templates: Vec<Template> = store.list().into_iter().cloned().collect();
            if json {
                println!(
                    "{}",
                    facet_json::to_string(&templates).expect("JSON serialization")
                );
                return Ok(());
            }
            if templates.is_empty() {
                println!("No templates found. Run `vmlab init` to install the defaults.");
                return Ok(());
            }
            let rows: Vec<TemplateRow> = templates
                .iter()
                .map(|t| TemplateRow {
                    name: t.name.clone(),
                    os: t.os.clone(),
                    version: t.version.clone(),
                    arch: t.arch.clone(),
                    cloud_image: if t.cloud_image { "yes" } else { "no" },
                    description: t.description.clone(),
                })
                .collect();
            let mut table = Table::new(&rows);
            table.with(Style::modern_rounded());
            println!("{table}");
        }
        TemplateCommand::Create {
            name,
            os,
            version,
            os_variant,
            arch,
            description,
            cloud_image_url,
            cloud_image,
        } => {
            let template = Template {
                name: name.clone(),
                os,
                version,
                os_variant: os_variant.unwrap_or_default(),
                arch,
                description: description.unwrap_or_default(),
                cloud_image: cloud_image || cloud_image_url.is_some(),
                cloud_image_url: cloud_image_url.unwrap_or_default(),
                ..Template::default()
            };
            store.create(template)?;
            println!("Template '{name}' created.");
        }
        TemplateCommand::Delete { name } => {
            if store.delete(&name)? {
                println!("Template '{name}' deleted.");
            } else {
                return Err(VmlabError::TemplateNotFound { name });
            }
        }
    }
    Ok(())
}

#[derive(Tabled)]
struct VmRow {
    name: String,
    state: String,
    cpus: u32,
    #[tabled(rename = "memory (MB)")]
    memory_mb: u64,
    #[tabled(rename = "max memory (MB)")]
    max_memory_mb: u64,
}

impl From<&VmSummary> for VmRow {
    fn from(vm: &VmSummary) -> Self {
        VmRow {
            name: vm.name.clone(),
            state: match &vm.error {
                Some(e) => format!("error: {e}"),
                None => vm.state.clone(),
            },
            cpus: vm.cpus,
            memory_mb: vm.memory_mb,
            max_memory_mb: vm.max_memory_mb,
        }
    }
}

async fn run_vm(
    config_dir: &Path,
    settings: &Settings,
    action: VmCommand,
) -> Result<(), VmlabError> {
    let uri = settings.libvirt_uri();
    let storage_dir = settings.storage_dir();

    match action {
        VmCommand::List { json } => {
            let hv = Hypervisor::open(uri)?;
            let vms = hv.list()?;
            if json {
                println!("{}", facet_json::to_string(&vms).expect("JSON serialization"));
                return Ok(());
            }
            if vms.is_empty() {
                println!("No virtual machines defined.");
                return Ok(());
            }
            let rows: Vec<VmRow> = vms.iter().map(VmRow::from).collect();
            let mut table = Table::new(&rows);
            table.with(Style::modern_rounded());
            println!("{table}");
        }

        VmCommand::Create {
            name,
            template,
            cpu,
            memory,
            disk_size,
            network,
            no_auto_install,
            force,
        } => {
            create_vm(
                config_dir,
                settings,
                CreateArgs {
                    name,
                    template,
                    cpu,
                    memory,
                    disk_size,
                    network,
                    no_auto_install,
                    force,
                },
            )
            .await?
        }

        VmCommand::Start { name } => {
            let hv = Hypervisor::open(uri)?;
            if hv.start(&name)? {
                println!("VM '{name}' started.");
            } else {
                println!("VM '{name}' is already running.");
            }
        }

        VmCommand::Stop { name, force } => {
            let hv = Hypervisor::open(uri)?;
            if hv.stop(&name, force)? {
                if force {
                    println!("VM '{name}' destroyed.");
                } else {
                    println!("Shutdown requested for VM '{name}'.");
                }
            } else {
                println!("VM '{name}' is not running.");
            }
        }

        VmCommand::Restart { name, force } => {
            let hv = Hypervisor::open(uri)?;
            if hv.stop(&name, force)? {
                wait_for_shutoff(&hv, &name).await?;
            }
            hv.start(&name)?;
            println!("VM '{name}' restarted.");
        }

        VmCommand::Suspend { name } => {
            let hv = Hypervisor::open(uri)?;
            if hv.suspend(&name)? {
                println!("VM '{name}' suspended.");
            } else {
                println!("VM '{name}' is not running.");
            }
        }

        VmCommand::Resume { name } => {
            let hv = Hypervisor::open(uri)?;
            if hv.resume(&name)? {
                println!("VM '{name}' resumed.");
            } else {
                println!("VM '{name}' is not suspended.");
            }
        }

        VmCommand::Delete {
            name,
            delete_disk,
            yes,
        } => {
            if !yes {
                let what = if delete_disk {
                    format!("Delete VM '{name}' and its disk?")
                } else {
                    format!("Delete VM '{name}'?")
                };
                if !confirm(&what, false)? {
                    println!("Aborted.");
                    return Ok(());
                }
            }

            let hv = Hypervisor::open(uri)?;
            // Collect disk paths before the domain disappears
            let disks = hv.info(&name).map(|i| i.disks).unwrap_or_default();
            hv.delete(&name)?;
            println!("VM '{name}' deleted.");

            if delete_disk {
                for d in disks {
                    if d.device == "disk"
                        && disk::delete_disk(Path::new(&d.source)).await?
                    {
                        println!("Deleted disk {}", d.source);
                    }
                }
                let seed = paths::seed_iso_path(&storage_dir, &name);
                if disk::delete_disk(&seed).await? {
                    println!("Deleted seed ISO {}", seed.display());
                }
            }
        }

        VmCommand::Info { name, json } => {
            let hv = Hypervisor::open(uri)?;
            let info = hv.info(&name)?;
            if json {
                println!("{}", facet_json::to_string(&info).expect("JSON serialization"));
                return Ok(());
            }
            println!("Name:      {}", info.name);
            println!("State:     {}", info.state);
            println!("vCPUs:     {}", info.cpus);
            println!(
                "Memory:    {} MB (max {} MB)",
                info.memory_mb, info.max_memory_mb
            );
            println!("CPU time:  {:.1}s", info.cpu_time_secs);
            for d in &info.disks {
                println!("Disk:      {} ({}) -> {}", d.target, d.device, d.source);
            }
            for i in &info.interfaces {
                println!("Network:   {}", interface_line(i));
            }
            for ip in &info.ips {
                println!("IP:        {ip}");
            }
        }

        VmCommand::SetCpu { name, cpu } => {
            let hv = Hypervisor::open(uri)?;
            hv.set_vcpus(&name, cpu)?;
            println!("VM '{name}' vCPU count set to {cpu}.");
        }

        VmCommand::SetMemory { name, memory } => {
            let hv = Hypervisor::open(uri)?;
            hv.set_memory(&name, memory)?;
            println!("VM '{name}' memory set to {memory} MB.");
        }

        VmCommand::Console { name } => {
            let hv = Hypervisor::open(uri)?;
            match hv.console_command(&name)? {
                Some(cmd) => {
                    println!("Connect to the console with:\n\n  {cmd}\n");
                    println!("(press Ctrl+] to exit the console)");
                }
                None => println!("VM '{name}' has no pty console configured."),
            }
        }

        VmCommand::SetPassword {
            name,
            username,
            password,
            no_start,
        } => {
            set_password(settings, &name, &username, password, no_start).await?;
        }

        VmCommand::FixPermissions { name } => {
            let hv = Hypervisor::open(uri)?;
            let info = hv.info(&name)?;
            let mut candidates: Vec<PathBuf> =
                info.disks.iter().map(|d| PathBuf::from(&d.source)).collect();
            // Also cover the conventional paths, in case the domain XML
            // points elsewhere or the seed ISO is detached
            candidates.push(paths::disk_path(&storage_dir, &name));
            candidates.push(paths::seed_iso_path(&storage_dir, &name));
            candidates.sort();
            candidates.dedup();

            let mut fixed = 0;
            for path in &candidates {
                if path.exists() {
                    disk::fix_permissions(path)?;
                    println!("Fixed permissions on {}", path.display());
                    fixed += 1;
                }
            }
            if fixed == 0 {
                println!("No disk files found for VM '{name}'.");
            }
        }
    }
    Ok(())
}

struct CreateArgs {
    name: String,
    template: String,
    cpu: u32,
    memory: u64,
    disk_size: u64,
    network: String,
    no_auto_install: bool,
    force: bool,
}

async fn create_vm(
    config_dir: &Path,
    settings: &Settings,
    args: CreateArgs,
) -> Result<(), VmlabError> {
    let store = TemplateStore::open(&paths::templates_dir(config_dir))?;
    let template = store
        .get(&args.template)
        .ok_or_else(|| VmlabError::TemplateNotFound {
            name: args.template.clone(),
        })?;

    let hv = Hypervisor::open(settings.libvirt_uri())?;
    if hv.exists(&args.name) {
        if !args.force
            && !confirm(
                &format!("VM '{}' already exists. Overwrite it?", args.name),
                true,
            )?
        {
            println!("Aborted.");
            return Ok(());
        }
        // Best effort: a half-defined leftover domain should not block recreation
        if let Err(e) = hv.delete(&args.name) {
            tracing::warn!("could not remove existing domain: {e}");
        }
    }

    let storage_dir = settings.storage_dir();
    let disk_path = paths::disk_path(&storage_dir, &args.name);
    if disk_path.exists() {
        if !args.force
            && !confirm(
                &format!("Disk {} already exists. Overwrite it?", disk_path.display()),
                true,
            )?
        {
            println!("Aborted.");
            return Ok(());
        }
        if let Err(e) = disk::delete_disk(&disk_path).await {
            tracing::warn!("could not remove existing disk: {e}");
        }
    }
    if let Some(parent) = disk_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| VmlabError::Io {
            context: format!("creating directory {}", parent.display()),
            source: e,
        })?;
    }

    let mut cloud_install = template.cloud_image && !args.no_auto_install;
    if cloud_install && image::resolve_url(template).is_err() {
        tracing::warn!(
            template = %template.name,
            "template has no cloud image URL, falling back to an empty disk"
        );
        cloud_install = false;
    }
    if cloud_install {
        let cached = image::ensure_image(template, &settings.cache_dir()).await?;
        disk::create_disk_from_image(&cached, &disk_path, args.disk_size).await?;
        println!("The guest filesystem expands to the full disk on first boot.");
    } else {
        disk::create_disk(&disk_path, args.disk_size).await?;
    }

    let xml = domain_xml::generate_domain_xml(
        &args.name,
        template,
        &disk_path,
        args.cpu,
        args.memory,
        &args.network,
    );
    hv.define(&xml)?;

    println!(
        "VM '{}' created from template '{}' ({} vCPUs, {} MB, {} GB disk).",
        args.name, template.name, args.cpu, args.memory, args.disk_size
    );
    println!("\nStart it with:\n\n  vmlab vm start {}", args.name);
    if cloud_install {
        println!(
            "\nThe cloud image ships without a known password. Set one with:\n\n  \
             vmlab vm set-password {} --username {}",
            args.name,
            default_cloud_user(template)
        );
    }
    Ok(())
}

/// Conventional default account baked into upstream cloud images.
fn default_cloud_user(template: &Template) -> &'static str {
    match template.os.as_str() {
        "debian" => "debian",
        "fedora" => "fedora",
        _ => "ubuntu",
    }
}

async fn set_password(
    settings: &Settings,
    name: &str,
    username: &str,
    password: Option<String>,
    no_start: bool,
) -> Result<(), VmlabError> {
    let password = match password {
        Some(p) => p,
        None => inquire::Password::new("New password:")
            .with_display_toggle_enabled()
            .prompt()
            .map_err(|e| VmlabError::Validation {
                message: format!("password prompt failed: {e}"),
            })?,
    };
    if password.is_empty() {
        return Err(VmlabError::Validation {
            message: "password must not be empty".into(),
        });
    }

    let hv = Hypervisor::open(settings.libvirt_uri())?;
    // The seed ISO is only read at boot, so the VM must come up fresh.
    let was_running = hv.is_active(name)?;
    if was_running {
        println!("Stopping VM '{name}' so the new seed is read at boot...");
        hv.stop(name, false)?;
        wait_for_shutoff(&hv, name).await?;
    }

    let iso = paths::seed_iso_path(&settings.storage_dir(), name);
    let user_data = cloudinit::password_user_data(username, &password);
    cloudinit::create_seed_iso(&user_data, None, &iso).await?;
    disk::fix_permissions(&iso)?;
    hv.attach_seed_iso(name, &iso)?;

    if no_start {
        println!(
            "Seed ISO attached. The password for '{username}' applies on the next boot of '{name}'."
        );
    } else {
        hv.start(name)?;
        println!(
            "VM '{name}' started. The password for '{username}' applies once cloud-init finishes."
        );
    }
    Ok(())
}

/// Wait up to 30s for a graceful shutdown, then destroy.
async fn wait_for_shutoff(hv: &Hypervisor, name: &str) -> Result<(), VmlabError> {
    let spinner = indicatif::ProgressBar::new_spinner();
    spinner.set_message(format!("Waiting for '{name}' to shut down"));
    spinner.enable_steady_tick(Duration::from_millis(120));

    for _ in 0..30 {
        if !hv.is_active(name)? {
            spinner.finish_and_clear();
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    spinner.set_message(format!("'{name}' did not shut down cleanly, destroying"));
    hv.stop(name, true)?;
    for _ in 0..10 {
        if !hv.is_active(name)? {
            spinner.finish_and_clear();
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    spinner.finish_and_clear();
    Err(VmlabError::Libvirt {
        message: format!("VM '{name}' would not stop"),
        hint: "inspect it with `virsh list --all`".into(),
    })
}

fn interface_line(iface: &InterfaceInfo) -> String {
    format!("{}: {} ({})", iface.mac, iface.source, iface.kind)
}

fn confirm(message: &str, default: bool) -> Result<bool, VmlabError> {
    inquire::Confirm::new(message)
        .with_default(default)
        .prompt()
        .map_err(|e| VmlabError::Validation {
            message: format!("confirmation prompt failed: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_row_carries_both_memory_figures() {
        let row = VmRow::from(&VmSummary {
            name: "lab-1".into(),
            state: "running".into(),
            cpus: 4,
            memory_mb: 2048,
            max_memory_mb: 4096,
            error: None,
        });
        assert_eq!(row.memory_mb, 2048);
        assert_eq!(row.max_memory_mb, 4096);
        assert_eq!(row.state, "running");
    }

    #[test]
    fn vm_row_surfaces_query_errors_as_state() {
        let row = VmRow::from(&VmSummary {
            name: "broken".into(),
            state: "error".into(),
            cpus: 0,
            memory_mb: 0,
            max_memory_mb: 0,
            error: Some("no permission".into()),
        });
        assert_eq!(row.state, "error: no permission");
    }

    #[test]
    fn interface_line_shows_mac_source_and_type() {
        let line = interface_line(&InterfaceInfo {
            mac: "52:54:00:aa:bb:cc".into(),
            kind: "network".into(),
            source: "default".into(),
        });
        assert_eq!(line, "52:54:00:aa:bb:cc: default (network)");
    }
}
