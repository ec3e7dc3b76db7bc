// propose.rs — `aegis propose` and `aegis proposals`.

use anyhow::{bail, Result};
use clap::Args;

use aegis_policy::{Action, Direction, PolicyRule, PortSpec, Protocol, RuleOrigin};
use aegis_service::Facade;

use super::{parse_proposal_state, short};

/// Arguments for `aegis propose`. Either `--text` (translator) or
/// structured flags, not both.
#[derive(Args)]
pub struct ProposeArgs {
    /// Natural-language intent, drafted through the translator.
    #[arg(long, conflicts_with_all = ["source", "destination", "action"])]
    pub text: Option<String>,

    /// Source address or CIDR.
    #[arg(long)]
    pub source: Option<String>,

    /// Destination address or CIDR.
    #[arg(long)]
    pub destination: Option<String>,

    /// drop, reject, or accept.
    #[arg(long, default_value = "drop")]
    pub action: String,

    /// input, output, or forward.
    #[arg(long, default_value = "input")]
    pub direction: String,

    /// tcp, udp, icmp, or any.
    #[arg(long, default_value = "any")]
    pub protocol: String,

    /// Destination port (repeatable).
    #[arg(long = "port")]
    pub ports: Vec<u16>,

    /// Free-text comment.
    #[arg(long, default_value = "")]
    pub comment: String,
}

pub async fn run(facade: &Facade, args: ProposeArgs) -> Result<()> {
    let proposal = if let Some(text) = &args.text {
        facade.propose_text(text).await?
    } else {
        facade.propose_rule(build_rule(&args)?).await?
    };

    println!("proposal {} ({})", proposal.id, proposal.state);
    if let Some(rendered) = &proposal.rendered {
        println!("  renders as: {}", rendered.text);
    }
    if let Some(explanation) = &proposal.explanation {
        println!("  translator: {}", explanation);
    }
    if let Some(conflicts) = &proposal.conflicts {
        for finding in &conflicts.findings {
            println!("  warning: {:?}: {}", finding.kind, finding.detail);
        }
    }
    println!("approve with: aegis approve {}", short(proposal.id));
    Ok(())
}

fn build_rule(args: &ProposeArgs) -> Result<PolicyRule> {
    if args.source.is_none() && args.destination.is_none() {
        bail!("propose needs --text, or at least --source/--destination");
    }

    let mut builder = PolicyRule::builder()
        .origin(RuleOrigin::User)
        .comment(args.comment.clone());

    builder = builder.action(match args.action.as_str() {
        "drop" => Action::Drop,
        "reject" => Action::Reject,
        "accept" => Action::Accept,
        other => bail!("unknown action '{}'", other),
    });
    builder = builder.direction(match args.direction.as_str() {
        "input" => Direction::Input,
        "output" => Direction::Output,
        "forward" => Direction::Forward,
        other => bail!("unknown direction '{}'", other),
    });
    builder = builder.protocol(match args.protocol.as_str() {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        "icmp" => Protocol::Icmp,
        "any" => Protocol::Any,
        other => bail!("unknown protocol '{}'", other),
    });

    if let Some(source) = &args.source {
        builder = builder.source(source)?;
    }
    if let Some(destination) = &args.destination {
        builder = builder.destination(destination)?;
    }
    match args.ports.len() {
        0 => {}
        1 => builder = builder.destination_port(args.ports[0]),
        _ => builder = builder.destination_port(PortSpec::List(args.ports.clone())),
    }

    Ok(builder.build()?)
}

pub fn list(facade: &Facade, state: Option<&str>) -> Result<()> {
    let filter = state.map(parse_proposal_state).transpose()?;
    let proposals = facade.list_proposals(filter)?;
    if proposals.is_empty() {
        println!("no proposals");
        return Ok(());
    }
    for proposal in proposals {
        println!(
            "{}  {:18} {:14} {}",
            short(proposal.id),
            proposal.state.to_string(),
            proposal.rule.origin.to_string(),
            proposal
                .rendered
                .as_ref()
                .map(|r| r.text.as_str())
                .unwrap_or("(not rendered)")
        );
    }
    Ok(())
}
