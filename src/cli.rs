use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vmlab", about = "Libvirt VM provisioning for reproducible research environments")]
pub struct Cli {
    /// Configuration directory (default: ~/.config/vmlab)
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize vmlab with default templates
    Init,

    /// Manage VM templates
    Template {
        #[command(subcommand)]
        action: TemplateCommand,
    },

    /// Manage cached cloud images
    Image {
        #[command(subcommand)]
        action: ImageCommand,
    },

    /// Manage virtual machines
    Vm {
        #[command(subcommand)]
        action: VmCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum TemplateCommand {
    /// List all available templates
    List {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Create a new template
    Create {
        /// Template name
        name: String,

        /// Operating system name
        #[arg(long)]
        os: String,

        /// OS version
        #[arg(long)]
        version: String,

        /// OS variant for libvirt (defaults to "<os><version>")
        #[arg(long)]
        os_variant: Option<String>,

        /// Architecture
        #[arg(long, default_value = "x86_64")]
        arch: String,

        /// Template description
        #[arg(long)]
        description: Option<String>,

        /// Cloud image download URL (implies cloud image support)
        #[arg(long)]
        cloud_image_url: Option<String>,

        /// Mark the template as supporting cloud images
        #[arg(long)]
        cloud_image: bool,
    },

    /// Delete a template
    Delete {
        /// Template name
        name: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// List cached cloud images
    List,

    /// Delete a cached cloud image by filename
    Delete { name: String },

    /// Delete all cached cloud images
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum VmCommand {
    /// List all virtual machines
    List {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Create a new virtual machine
    Create {
        /// VM name
        name: String,

        /// Template name
        #[arg(short, long)]
        template: String,

        /// Number of vCPUs
        #[arg(short, long, default_value_t = 2)]
        cpu: u32,

        /// Memory in MB
        #[arg(short, long, default_value_t = 2048)]
        memory: u64,

        /// Disk size in GB
        #[arg(short, long, default_value_t = 20)]
        disk_size: u64,

        /// Libvirt network name
        #[arg(long, default_value = "default")]
        network: String,

        /// Create an empty disk instead of installing from a cloud image
        #[arg(long)]
        no_auto_install: bool,

        /// Overwrite an existing VM/disk without prompting
        #[arg(short, long)]
        force: bool,
    },

    /// Start a virtual machine
    Start { name: String },

    /// Stop a virtual machine
    Stop {
        name: String,

        /// Force stop (destroy) instead of ACPI shutdown
        #[arg(short, long)]
        force: bool,
    },

    /// Restart a virtual machine (stop, then start)
    Restart {
        name: String,

        /// Force stop instead of ACPI shutdown
        #[arg(short, long)]
        force: bool,
    },

    /// Suspend a running virtual machine
    Suspend { name: String },

    /// Resume a suspended virtual machine
    Resume { name: String },

    /// Delete a virtual machine
    Delete {
        name: String,

        /// Also delete the disk image
        #[arg(long)]
        delete_disk: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show detailed information about a virtual machine
    Info {
        name: String,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Set the vCPU count for a virtual machine
    SetCpu { name: String, cpu: u32 },

    /// Set the memory for a virtual machine (in MB)
    SetMemory { name: String, memory: u64 },

    /// Show the console command for a virtual machine
    Console { name: String },

    /// Set a user password via a cloud-init seed ISO
    SetPassword {
        name: String,

        /// Username to set the password for
        #[arg(short, long, default_value = "ubuntu")]
        username: String,

        /// Password (prompted interactively when omitted)
        #[arg(short, long)]
        password: Option<String>,

        /// Leave the VM stopped after attaching the seed ISO
        #[arg(long)]
        no_start: bool,
    },

    /// Fix disk file permissions so libvirt can access them
    FixPermissions { name: String },
}
