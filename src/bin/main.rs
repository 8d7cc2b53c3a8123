use anyhow::Result;
use clap::{Parser, Subcommand};
use identity_consolidation::db::{OrganizationCreate, QueryBuilder};
use identity_consolidation::types::FacilityId;
use identity_consolidation::{
    create_service, load_config, IdentityService, NewUser, PersonName, Role, SystemIdentity,
};
use std::collections::BTreeSet;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "identity-consolidation")]
#[command(about = "Identity and access consolidation for organizations and facilities")]
struct Cli {
    /// Database url; overrides the config file
    #[arg(long, global = true, env = "IDENTITY_DB_URL")]
    db_url: Option<String>,
    /// Treat the internal store as authoritative; overrides the config file
    #[arg(long, global = true, env = "IDENTITY_MIGRATED")]
    migrated: Option<bool>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,
    /// Create an organization
    CreateOrganization {
        #[arg(long)]
        external_id: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = true)]
        identity_verified: bool,
    },
    /// Create a facility in an organization
    CreateFacility {
        /// External id of the owning organization
        #[arg(long)]
        org: String,
        #[arg(long)]
        name: String,
    },
    /// Provision a user (or reclaim an archived login)
    CreateUser {
        #[arg(long)]
        org: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long, default_value = "USER")]
        role: Role,
        #[arg(long, default_value_t = false)]
        all_facilities: bool,
        /// Facility id; repeat for several
        #[arg(long = "facility")]
        facilities: Vec<String>,
    },
    /// Search an organization's user directory
    ListUsers {
        #[arg(long)]
        org: String,
        #[arg(long, default_value_t = 0)]
        page: usize,
        #[arg(long, default_value_t = 10)]
        page_size: usize,
        #[arg(short, long)]
        query: Option<String>,
    },
    /// Ensure the system identities exist and print them
    SystemUsers,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("identity_consolidation=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    let mut config = load_config()?;
    if let Some(db_url) = cli.db_url {
        config.database.url = db_url;
    }
    if let Some(migrated) = cli.migrated {
        config.migration_enabled = migrated;
    }
    info!("Using database url: {}", config.database.url);

    let service = create_service(config).await?;

    match cli.command {
        Commands::Init => {
            info!("Database initialized successfully");
        }
        Commands::CreateOrganization {
            external_id,
            name,
            identity_verified,
        } => {
            let org = QueryBuilder::create_organization(
                service.db(),
                &OrganizationCreate {
                    external_id,
                    name,
                    identity_verified,
                },
            )
            .await?;
            println!("Organization created: {} ({})", org.external_id, org.internal_id);
        }
        Commands::CreateFacility { org, name } => {
            let organization = QueryBuilder::find_organization_by_external_id(service.db(), &org)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Organization not found: {}", org))?;
            let facility =
                QueryBuilder::create_facility(service.db(), &organization.internal_id, &name).await?;
            println!("Facility created: {} ({})", facility.name, facility.internal_id);
        }
        Commands::CreateUser {
            org,
            email,
            first_name,
            last_name,
            role,
            all_facilities,
            facilities,
        } => {
            create_user(
                &service,
                &org,
                NewUser {
                    login_email: email,
                    name: PersonName::new(first_name, last_name),
                    role,
                    access_all_facilities: all_facilities,
                    facility_ids: facilities.into_iter().map(FacilityId::from).collect::<BTreeSet<_>>(),
                },
            )
            .await?;
        }
        Commands::ListUsers {
            org,
            page,
            page_size,
            query,
        } => {
            let result = service
                .manager()
                .search_directory(&org, page, page_size, query.as_deref())
                .await?;

            if result.users.is_empty() {
                println!("No users found.");
                return Ok(());
            }

            println!("{:<40} {:<30} {:<12}", "EMAIL", "NAME", "STATUS");
            println!("{}", "-".repeat(84));
            for entry in &result.users {
                let status = entry
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<40} {:<30} {:<12}",
                    entry.user.login_email,
                    format!("{}, {}", entry.user.name.last_name, entry.user.name.first_name),
                    status
                );
            }
            println!();
            println!(
                "Page {} ({} per page): {} matching of {} users",
                result.page, result.page_size, result.total_filtered, result.total_unfiltered
            );
        }
        Commands::SystemUsers => {
            for identity in SystemIdentity::ALL {
                let user = service.resolver().system_user(identity).await?;
                println!("{:<28} {:<55} {}", identity.as_str(), user.login_email, user.internal_id);
            }
        }
    }

    Ok(())
}

async fn create_user(service: &IdentityService, org: &str, request: NewUser) -> Result<()> {
    let manager = service.manager();
    let actor = manager.anonymous_user().await?;
    let access = manager.provision_user(&actor, org, &request).await?;

    println!("User provisioned: {} ({})", access.user.login_email, access.user.internal_id);
    if let Some(roles) = access.roles {
        let names: Vec<&str> = roles.granted_roles.iter().map(|r| r.as_str()).collect();
        println!("  Roles:      {}", names.join(", "));
        println!("  Facilities: {}", roles.facilities.len());
    }
    Ok(())
}
