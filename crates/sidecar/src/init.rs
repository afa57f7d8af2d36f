// DIREKTIV_APP=init
//
// Copies the running executable into a shared volume so action containers
// can start the command executor from it.

use std::path::Path;

use tracing::info;

use crate::error::ExecError;

pub async fn install(target: &Path) -> Result<u64, ExecError> {
    let source = std::env::current_exe()?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let copied = tokio::fs::copy(&source, target).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755)).await?;
    }

    info!(source = %source.display(), target = %target.display(), bytes = copied, "executor installed");
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_install_copies_executable() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("bin").join("direktiv-cmd");
        let copied = install(&target).await.unwrap();
        assert!(copied > 0);
        let meta = std::fs::metadata(&target).unwrap();
        assert_eq!(meta.len(), copied);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(meta.permissions().mode() & 0o777, 0o755);
        }
    }
}
