//! Command line and `initialize` parameters for the Java language server.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

/// Location of the language server installation
///
/// Every path except `config_home` is relative to `config_home`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JavaToolchain {
    pub config_home: PathBuf,
    /// JDK handed to the language server as `java.home`
    pub jre_path: PathBuf,
    /// The `java` executable used to run the language server
    pub jre_execute: PathBuf,
    /// Equinox launcher jar
    pub launch_package_file: PathBuf,
    /// Platform configuration directory, e.g. `config_linux`
    pub launch_config_path: PathBuf,
    /// Debug plugin bundle
    pub dap_package_file: PathBuf,
}

impl JavaToolchain {
    fn resolve(&self, path: &Path) -> PathBuf {
        self.config_home.join(path)
    }

    pub fn java_executable(&self) -> PathBuf {
        self.resolve(&self.jre_execute)
    }

    pub fn jdk_home(&self) -> PathBuf {
        self.resolve(&self.jre_path)
    }

    pub fn launcher(&self) -> PathBuf {
        self.resolve(&self.launch_package_file)
    }

    pub fn configuration(&self) -> PathBuf {
        self.resolve(&self.launch_config_path)
    }

    pub fn debug_bundle(&self) -> PathBuf {
        self.resolve(&self.dap_package_file)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.config_home.join("data").join("jdt_ws")
    }

    pub fn heap_dump_path(&self) -> PathBuf {
        self.config_home
            .join("data")
            .join("heapdump")
            .join("headdump.java")
    }

    /// Files that must exist before the language server can start
    pub fn missing_files(&self) -> Vec<PathBuf> {
        [
            self.java_executable(),
            self.launcher(),
            self.debug_bundle(),
        ]
        .into_iter()
        .filter(|path| !path.is_file())
        .collect()
    }
}

/// Arguments passed to the `java` executable; `jdwp_port` is where the JDWP
/// agent of the language server listens.
pub fn backend_args(toolchain: &JavaToolchain, jdwp_port: u16) -> Vec<String> {
    let mut args = vec![
        format!(
            "-agentlib:jdwp=transport=dt_socket,server=y,suspend=n,address={jdwp_port},quiet=y"
        ),
        "--add-modules=ALL-SYSTEM".to_string(),
    ];
    for module in ["java.util", "java.lang", "sun.nio.fs"] {
        args.push("--add-opens".to_string());
        args.push(format!("java.base/{module}=ALL-UNNAMED"));
    }
    args.extend(
        [
            "-Declipse.application=org.eclipse.jdt.ls.core.id1",
            "-Dosgi.bundles.defaultStartLevel=4",
            "-Declipse.product=org.eclipse.jdt.ls.core.product",
            "-Dlog.level=ALL",
            "-Djava.import.generatesMetadataFilesAtProjectRoot=false",
            "-Dfile.encoding=utf8",
            "-XX:+UseParallelGC",
            "-XX:GCTimeRatio=4",
            "-XX:AdaptiveSizePolicyWeight=90",
            "-Dsun.zip.disableMemoryMapping=true",
            "-Xmx1G",
            "-Xms100m",
            "-Xlog:jni+resolve=off",
            "-XX:+HeapDumpOnOutOfMemoryError",
        ]
        .map(String::from),
    );
    args.push(format!(
        "-XX:HeapDumpPath={}",
        toolchain.heap_dump_path().display()
    ));
    args.push("-jar".to_string());
    args.push(toolchain.launcher().display().to_string());
    args.push("-configuration".to_string());
    args.push(toolchain.configuration().display().to_string());
    args.push("-data".to_string());
    args.push(toolchain.data_dir().display().to_string());
    args
}

fn file_url(path: &Path) -> eyre::Result<Url> {
    Url::from_file_path(path)
        .map_err(|_| eyre::eyre!("{} is not an absolute path", path.display()))
}

/// Parameters of the `initialize` request for `workspace`
pub fn initialize_params(
    process_id: u32,
    workspace: &Path,
    trigger_file: Option<&Path>,
    toolchain: &JavaToolchain,
) -> eyre::Result<Value> {
    let workspace_url = file_url(workspace)?;
    let trigger_files = match trigger_file {
        Some(path) => vec![file_url(path)?.to_string()],
        None => Vec::new(),
    };
    let name = workspace
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(json!({
        "processId": process_id,
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "locale": "en",
        "rootPath": workspace_url.as_str(),
        "rootUri": workspace_url.as_str(),
        "capabilities": {},
        "initializationOptions": {
            "bundles": [toolchain.debug_bundle()],
            "workspaceFolders": [workspace_url.as_str()],
            "settings": {
                "java": {
                    "home": toolchain.jdk_home(),
                    "import": {
                        "maven": { "enabled": true, "offline": { "enabled": false } },
                        "gradle": { "enabled": true, "wrapper": { "enabled": true } },
                        "exclusions": [
                            "**/node_modules/**",
                            "**/.metadata/**",
                            "**/archetype-resources/**",
                            "**/META-INF/maven/**",
                        ],
                        "generatesMetadataFilesAtProjectRoot": false,
                    },
                    "debug": {
                        "logLevel": "verbose",
                        "settings": {
                            "showToString": true,
                            "showLogicalStructure": true,
                            "hotCodeReplace": "manual",
                            "forceBuildBeforeLaunch": true,
                            "jdwp": {
                                "limitOfVariablesPerJdwpRequest": 100,
                                "requestTimeout": 3000,
                                "async": "auto",
                            },
                        },
                    },
                    "silentNotification": false,
                },
            },
            "extendedClientCapabilities": {
                "progressReportProvider": true,
                "classFileContentsSupport": true,
                "shouldLanguageServerExitOnShutdown": true,
            },
            "triggerFiles": trigger_files,
        },
        "trace": "verbose",
        "workspaceFolders": [{
            "uri": workspace_url.as_str(),
            "name": name,
        }],
    }))
}
