//! arbor-test-full
//!
//! End-to-end exercise of the declarative layer: declares an order-flow
//! statechart, materializes it against an in-memory build context, and
//! drives a few dispatches through the produced states.

use anyhow::Result;
use arbor::core::{
    DataAccess, DataKey, Disposition, EntryChannel, InitialData, JsonCodec, MessageContext,
    NodeKind, Payload, StateKey, TransitionContext, TreeBuildContext, TreeBuilder,
    TreeDefinitionError, TreeHost, TreeNodeBuildInfo, TreeState,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

// ============================================================
// Messages and state data
// ============================================================

#[derive(Debug)]
struct AddItem {
    price: u32,
}

#[derive(Debug)]
struct Checkout;

#[derive(Debug, Clone)]
struct CartSnapshot {
    total: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OrderTotals {
    total: u32,
    items: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckoutData {
    amount_due: u32,
}

// ============================================================
// Tree declaration
// ============================================================

struct OrderFlow {
    tree: TreeBuilder,
    order: DataKey<OrderTotals>,
    browsing: StateKey,
    checkout: DataKey<CheckoutData>,
    paid: StateKey,
}

fn declare_order_flow() -> Result<OrderFlow, TreeDefinitionError> {
    let order: DataKey<OrderTotals> = DataKey::new("order");
    let browsing = StateKey::new("browsing");
    let checkout: DataKey<CheckoutData> = DataKey::new("checkout");
    let paid = StateKey::new("paid");

    let checkout_chan: EntryChannel<CartSnapshot> = EntryChannel::for_data_state(&checkout);

    let mut tree = TreeBuilder::new_with_data_root(
        &order,
        InitialData::new(|_| OrderTotals::default()),
        &browsing,
        |s| {
            s.codec(Arc::new(JsonCodec::<OrderTotals>::new()));
        },
    )
    .with_log_name("order-flow");

    {
        let order = order.clone();
        let chan = checkout_chan.clone();
        tree.state(&browsing, |s| {
            s.on_message_with_data::<AddItem, OrderTotals, _>(&order, |m, totals| {
                m.stay().action("accumulate", move |item, ctx| {
                    let _ = totals.update(ctx, |t| {
                        t.total += item.price;
                        t.items += 1;
                    });
                })
            });
            let order_for_payload = order.clone();
            s.on_message::<Checkout, _>(move |m| {
                m.go_to_channel(&chan, move |_msg, ctx| CartSnapshot {
                    total: ctx.data(&order_for_payload).unwrap_or_default().total,
                })
                .label("to checkout")
            });
        })?;
    }

    tree.data_state(
        &checkout,
        checkout_chan.initial_data(|snapshot, _ctx| CheckoutData {
            amount_due: snapshot.total,
        }),
        |s| {
            s.codec(Arc::new(JsonCodec::<CheckoutData>::new()));
            s.on_enter(|t| {
                t.run("announce", |ctx| {
                    tracing::info!(state = %ctx.current(), "entered checkout");
                })
                .schedule(Duration::from_secs(300), |_ctx| Checkout)
            });
            s.on_message_value(
                "pay".to_string(),
                |m| m.go_to(&paid).label("payment accepted"),
                Some("pay"),
            );
            s.on_message_value(
                "cancel".to_string(),
                |m| m.go_to(&browsing).label("back to browsing"),
                Some("cancel"),
            );
        },
    )?;

    tree.final_state(&paid, |_| {})?;

    Ok(OrderFlow {
        tree,
        order,
        browsing,
        checkout,
        paid,
    })
}

// ============================================================
// In-memory build context and host
// ============================================================

struct SimNode {
    key: StateKey,
    kind: NodeKind,
    state: TreeState,
    children: Vec<SimNode>,
}

impl SimNode {
    fn find(&self, key: &StateKey) -> Option<&SimNode> {
        if &self.key == key {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(key))
    }
}

#[derive(Default)]
struct SimBuild {
    registered: HashSet<StateKey>,
}

impl SimBuild {
    fn build(&mut self, info: TreeNodeBuildInfo<'_, Self>) -> Result<SimNode, TreeDefinitionError> {
        if !self.registered.insert(info.key.clone()) {
            return Err(TreeDefinitionError::DuplicateState {
                key: info.key.clone(),
            });
        }
        let state = (info.state_factory)(info.key.clone());
        let mut children = Vec::new();
        for child in info.child_builders {
            children.push(child(self)?);
        }
        Ok(SimNode {
            key: info.key,
            kind: info.kind,
            state,
            children,
        })
    }
}

impl TreeBuildContext for SimBuild {
    type Node = SimNode;

    fn build_root(
        &mut self,
        info: TreeNodeBuildInfo<'_, Self>,
    ) -> Result<Self::Node, TreeDefinitionError> {
        self.build(info)
    }

    fn build_interior(
        &mut self,
        info: TreeNodeBuildInfo<'_, Self>,
    ) -> Result<Self::Node, TreeDefinitionError> {
        self.build(info)
    }

    fn build_leaf(
        &mut self,
        info: TreeNodeBuildInfo<'_, Self>,
    ) -> Result<Self::Node, TreeDefinitionError> {
        self.build(info)
    }
}

#[derive(Default)]
struct SimHost {
    data: HashMap<StateKey, Payload>,
    posted: Vec<Payload>,
    scheduled: Vec<(Duration, Payload)>,
}

impl TreeHost for SimHost {
    fn state_data(&self, key: &StateKey) -> Option<&(dyn Any + Send)> {
        self.data.get(key).map(|value| &**value)
    }

    fn state_data_mut(&mut self, key: &StateKey) -> Option<&mut (dyn Any + Send)> {
        self.data.get_mut(key).map(|value| &mut **value)
    }

    fn post(&mut self, message: Payload) {
        self.posted.push(message);
    }

    fn schedule(&mut self, delay: Duration, message: Payload) {
        self.scheduled.push((delay, message));
    }
}

// ============================================================
// Drive
// ============================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let flow = declare_order_flow()?;

    // Structural view, as diagram tooling would consume it.
    let info = flow.tree.info_graph()?;
    println!("{}", serde_json::to_string_pretty(&info)?);

    // Materialize into the in-memory node graph.
    let root = flow.tree.materialize(&mut SimBuild::default())?;
    println!(
        "materialized '{}' with {} top-level states",
        root.key,
        root.children.len()
    );

    // Seed the root's data the way a runtime would on entry.
    let mut host = SimHost::default();
    let mut enter_ctx = TransitionContext::new(flow.order.key().clone(), &mut host);
    let seeded = root
        .state
        .initial_data(&mut enter_ctx)
        .expect("root is a data state")
        .expect("initial data factory is infallible here");
    host.data.insert(flow.order.key().clone(), seeded);

    let browsing = root.find(&flow.browsing).expect("browsing is declared");

    // Two purchases accumulate into the ancestor's data.
    for price in [30, 12] {
        let mut ctx = MessageContext::new(flow.browsing.clone(), &mut host);
        let disposition = browsing
            .state
            .handle(&AddItem { price }, &mut ctx)
            .resolve()
            .await;
        assert!(matches!(disposition, Disposition::Stay));
    }
    let totals = host.data[flow.order.key()]
        .downcast_ref::<OrderTotals>()
        .expect("order data is OrderTotals");
    println!("order totals after browsing: {totals:?}");
    assert_eq!(totals.total, 42);

    // Checkout carries a channel payload derived from the order data.
    let mut ctx = MessageContext::new(flow.browsing.clone(), &mut host);
    let disposition = browsing
        .state
        .handle(&Checkout, &mut ctx)
        .resolve()
        .await;
    let (target, payload) = match disposition {
        Disposition::GoTo { target, payload } => (target, payload),
        other => anyhow::bail!("unexpected disposition: {other:?}"),
    };
    assert_eq!(&target, flow.checkout.key());

    // Entering checkout through the channel seeds its data and runs entry
    // actions (the scheduled reminder lands in the host).
    let checkout = root.find(flow.checkout.key()).expect("checkout is declared");
    let mut enter_ctx = TransitionContext::new(flow.checkout.key().clone(), &mut host)
        .with_payload(payload.expect("channel transitions carry a payload"));
    let data = checkout
        .state
        .initial_data(&mut enter_ctx)
        .expect("checkout is a data state")?;
    checkout.state.enter(&mut enter_ctx).resolve().await?;
    host.data.insert(flow.checkout.key().clone(), data);
    assert_eq!(host.scheduled.len(), 1);

    let due = host.data[flow.checkout.key()]
        .downcast_ref::<CheckoutData>()
        .expect("checkout data is CheckoutData");
    println!("amount due at checkout: {}", due.amount_due);
    assert_eq!(due.amount_due, 42);

    // Value-keyed dispatch sends "pay" to the final state.
    let mut ctx = MessageContext::new(flow.checkout.key().clone(), &mut host);
    let disposition = checkout
        .state
        .handle(&"pay".to_string(), &mut ctx)
        .resolve()
        .await;
    match disposition {
        Disposition::GoTo { target, .. } => assert_eq!(target, flow.paid),
        other => anyhow::bail!("unexpected disposition: {other:?}"),
    }

    let paid = root.find(&flow.paid).expect("paid is declared");
    assert_eq!(paid.kind, NodeKind::Leaf { is_final: true });
    println!("order flow completed");

    Ok(())
}
