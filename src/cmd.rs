use ldap3::exop::{WhoAmI, WhoAmIResp};

use ldappool::credentials::{CredentialCipher, KEY_ENV};
use ldappool::{Config, LdapConnection, PoolManager, PoolType, RecoveryManager};

/// The pool types worth checking: the given one, or every configured one.
fn pool_types(config: &Config, pool: Option<PoolType>) -> Vec<PoolType> {
    match pool {
        Some(pool) => vec![pool],
        None => PoolType::ALL
            .into_iter()
            .filter(|t| *t != PoolType::Log || config.log_service.is_some())
            .collect(),
    }
}

async fn whoami(conn: &mut LdapConnection) -> anyhow::Result<String> {
    let (exop, _) = conn.ldap().extended(WhoAmI).await?.success()?;
    let resp: WhoAmIResp = exop.parse();

    Ok(match resp.authzid.as_str() {
        "" => "anonymous".to_owned(),
        id => id.to_owned(),
    })
}

pub async fn check_cmd(config: Config, pool: Option<PoolType>, legacy: bool) -> anyhow::Result<()> {
    let types = pool_types(&config, pool);

    if legacy {
        return check_legacy(&config, &types).await;
    }

    let manager = PoolManager::new(config);
    manager.init().await?;

    let mut failed = 0;
    for pool_type in types {
        let result = async {
            let mut conn = manager.acquire(pool_type).await?;
            let who = whoami(&mut conn).await?;
            manager.release(conn, pool_type)?;
            anyhow::Ok(who)
        }
        .await;

        match result {
            Ok(who) => {
                let status = manager.status(pool_type).unwrap_or_default();
                println!(
                    "{pool_type:<6} ok    as {who} (idle {}, in use {}, max {})",
                    status.idle, status.in_use, status.max
                );
            }
            Err(e) => {
                error!("{pool_type} pool check failed: {e:#}");
                println!("{pool_type:<6} FAIL  {e:#}");
                failed += 1;
            }
        }
    }

    if let Err(e) = manager.close_all().await {
        warn!("error while closing pools: {e}");
    }

    if failed > 0 {
        bail!("{failed} pool(s) failed the check");
    }

    Ok(())
}

async fn check_legacy(config: &Config, types: &[PoolType]) -> anyhow::Result<()> {
    let manager = RecoveryManager::from_config(config)?;

    let mut failed = 0;
    for &pool_type in types {
        let result = async {
            let mut conn = manager.get_connection(pool_type).await?;
            let who = whoami(&mut conn).await?;
            manager.release(conn, pool_type)?;
            anyhow::Ok(who)
        }
        .await;

        match result {
            Ok(who) => println!("{pool_type:<6} ok    as {who}"),
            Err(e) => {
                error!("{pool_type} pool check failed: {e:#}");
                println!("{pool_type:<6} FAIL  {e:#}");
                failed += 1;
            }
        }
    }

    if manager.recoveries() > 0 {
        info!("{} pool recoveries during the check", manager.recoveries());
    }
    if let Err(e) = manager.shutdown().await {
        warn!("error while closing pools: {e}");
    }

    if failed > 0 {
        bail!("{failed} pool(s) failed the check");
    }

    Ok(())
}

/// Prompts for a password twice and prints the line to paste into the configuration.
pub fn encrypt_cmd(config_file: &str) -> anyhow::Result<()> {
    let cipher = match Config::load_from_file(config_file) {
        Ok(config) => config.cipher()?,
        Err(e) => {
            debug!("not using {config_file}: {e}");
            std::env::var(KEY_ENV)
                .ok()
                .map(|key| CredentialCipher::from_base64(&key))
                .transpose()?
        }
    };

    let Some(cipher) = cipher else {
        bail!("no key available: set [security] key in {config_file} or {KEY_ENV}");
    };

    let password = rpassword::prompt_password("Password: ")?;
    let repeated = rpassword::prompt_password("Repeat password: ")?;
    if password != repeated {
        bail!("passwords do not match");
    }

    println!("password_encrypted = \"{}\"", cipher.encrypt(&password)?);

    Ok(())
}

pub fn keygen_cmd() {
    println!("key = \"{}\"", CredentialCipher::generate_key());
}
