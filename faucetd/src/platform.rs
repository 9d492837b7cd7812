//! OS-specific defaults that don't belong in the portable config format.

use std::path::PathBuf;

/// Best-effort guess at Dogecoin Core's default testnet cookie file
/// location, used only to pre-fill a freshly generated config file. Returns
/// `None` if the home directory can't be determined; the operator is then
/// expected to fill in `rpc.cookie_file` (or `rpc.username`/`rpc.password`)
/// by hand.
pub fn default_cookie_file() -> Option<String> {
    let home = home_dir()?;
    let path = datadir(&home).join("testnet3").join(".cookie");
    Some(path.to_string_lossy().into_owned())
}

#[cfg(target_os = "windows")]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("APPDATA").map(PathBuf::from)
}

#[cfg(not(target_os = "windows"))]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(target_os = "windows")]
fn datadir(appdata: &std::path::Path) -> PathBuf {
    appdata.join("DogecoinCore")
}

#[cfg(target_os = "macos")]
fn datadir(home: &std::path::Path) -> PathBuf {
    home.join("Library").join("Application Support").join("DogecoinCore")
}

#[cfg(all(unix, not(target_os = "macos")))]
fn datadir(home: &std::path::Path) -> PathBuf {
    home.join(".dogecoin")
}
