use super::optimizer::{State as OptimizerState, Value as OptimizerValue};
use crate::error::shape_error;
use anyhow::Result;
use ndarray::{
    ArcArray, Array, ArrayViewMut, Dimension, Ix0, Ix1, Ix2, Ix4, IxDyn, ShapeError,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    marker::PhantomData,
    sync::{Arc, Weak},
};

type GradLock = Arc<RwLock<Option<ArcArray<f32, IxDyn>>>>;

/// Recording operations on variables.
pub mod builder {
    use super::*;

    /// Records the backward edges of a layer operation.
    ///
    /// A layer computes its output array eagerly, adds one edge per input that requires a
    /// gradient, then builds the output variable. Scaling a feature map by 2:
    ///
    ///```
    /// # use anyhow::Result;
    /// # use ndarray::{Array4, ArcArray, Ix4};
    /// # use vesselseg::learn::neural_network::autograd::{Variable, Variable4};
    /// # fn main() -> Result<()> {
    /// let input = Variable4::from(Array4::<f32>::ones([1, 2, 2, 3]));
    /// let mut builder = Variable::builder();
    /// if let Some(node) = input.node() {
    ///     builder.edge(node, |output_grad: ArcArray<f32, Ix4>| {
    ///         Ok(output_grad.mapv(|dy| 2. * dy).into_shared())
    ///     });
    /// }
    /// let output = builder.build(input.value().mapv(|x| 2. * x).into_shared());
    /// assert_eq!(output.shape(), &[1, 2, 2, 3]);
    /// # Ok(())
    /// # }
    ///```
    pub struct VariableBuilder<D: Dimension> {
        grad: Option<GradLock>,
        edges: Vec<EdgeInner>,
        _m: PhantomData<D>,
    }

    impl<D: Dimension + 'static> VariableBuilder<D> {
        pub(super) fn new() -> Self {
            Self {
                grad: None,
                edges: Vec::new(),
                _m: PhantomData,
            }
        }
        /// Gives the output a gradient slot even without edges.
        pub fn node(mut self) -> Self {
            if self.grad.is_none() {
                self.grad.replace(Arc::new(RwLock::default()));
            }
            self
        }
        /// Adds an edge from the output to `node`.
        ///
        /// `f` maps the output gradient to the gradient of `node`, it must have the shape of
        /// `node`. A skip tensor consumed by both a pool and an unpool gets one edge from each, and
        /// the two gradients are summed.
        pub fn edge<D2, F>(&mut self, node: &Node<D2>, f: F)
        where
            D2: Dimension + 'static,
            F: FnOnce(ArcArray<f32, D>) -> Result<ArcArray<f32, D2>> + Send + Sync + 'static,
        {
            let output_grad_lock = self
                .grad
                .get_or_insert_with(|| Arc::new(RwLock::default()))
                .clone();
            let mut output_grad_lock = Some(output_grad_lock);
            let node = node.inner.clone();
            let mut input_grad_lock = Some(Arc::downgrade(&node.grad));
            let dim = node.dim.clone();
            let name = std::any::type_name::<F>();
            let mut f = Some(f);
            let op = Box::new(move || -> Result<()> {
                let input_grad_lock = input_grad_lock.take().and_then(|x| Weak::upgrade(&x));
                if let Some((f, (input_grad_lock, output_grad_lock))) =
                    f.take().zip(input_grad_lock.zip(output_grad_lock.take()))
                {
                    let grad = output_grad_lock.read().clone();
                    std::mem::drop(output_grad_lock);
                    let grad = if let Some(grad) = grad {
                        grad.into_dimensionality::<D>()?
                    } else {
                        return Ok(());
                    };
                    let grad = (f)(grad)?;
                    if grad.shape() != dim.slice() {
                        return Err(shape_error!(
                            "{name} produced a gradient of shape {:?}, expected {:?}",
                            grad.shape(),
                            dim.slice()
                        ));
                    }
                    let mut guard = input_grad_lock.write();
                    if let Some(input_grad) = guard.as_mut() {
                        *input_grad += &grad.into_dyn();
                    } else {
                        guard.replace(grad.into_dyn());
                    }
                }
                Ok(())
            });
            self.edges.push(EdgeInner { name, op, node })
        }
        /// Builds the variable with `value`.
        pub fn build(self, value: ArcArray<f32, D>) -> Variable<D> {
            let node = self.grad.map(|grad| {
                Node::new(value.raw_dim().into_dyn(), grad, self.edges)
            });
            Variable { value, node }
        }
    }
}
use builder::*;

struct EdgeInner {
    name: &'static str,
    op: Box<dyn FnMut() -> Result<()> + Send + Sync + 'static>,
    node: Arc<NodeInner>,
}

impl Debug for EdgeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeInner")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

struct NodeInner {
    dim: IxDyn,
    grad: GradLock,
    edges: Mutex<Vec<EdgeInner>>,
}

impl NodeInner {
    // Every consumer holds a weak reference to the gradient until its edge ran.
    fn ready(&self) -> bool {
        Arc::weak_count(&self.grad) == 0
    }
}

impl Debug for NodeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeInner")
            .field("dim", &self.dim.slice())
            .field("edges", &self.edges.lock().len())
            .finish()
    }
}

/// The gradient slot of a variable and the edges to its inputs.
///
/// [`backward()`](Node::backward) visits the nodes breadth first, a node runs its edges once all
/// of its consumers have contributed to its gradient.
#[derive(Clone, Debug)]
pub struct Node<D: Dimension> {
    inner: Arc<NodeInner>,
    _m: PhantomData<D>,
}

impl<D: Dimension> Node<D> {
    fn new(dim: IxDyn, grad: GradLock, edges: Vec<EdgeInner>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                dim,
                grad,
                edges: Mutex::new(edges),
            }),
            _m: PhantomData,
        }
    }
    /// The gradient.
    pub fn grad(&self) -> Option<ArcArray<f32, D>> {
        self.inner.grad.read().clone()?.into_dimensionality().ok()
    }
    /// Executes the backward pass, seeding the gradient with ones.
    pub fn backward(&self) -> Result<()> {
        let grad = ArcArray::<f32, _>::ones(self.inner.dim.clone());
        self.backward_grad(grad.into_dimensionality()?)
    }
    /// Executes the backward pass with `grad`.
    pub fn backward_grad(&self, grad: ArcArray<f32, D>) -> Result<()> {
        {
            let mut guard = self.inner.grad.write();
            if guard.is_some() {
                return Ok(());
            }
            guard.replace(grad.into_dyn());
        }
        let mut queue = VecDeque::new();
        queue.push_back(self.inner.clone());
        while let Some(node) = queue.pop_front() {
            let edges = std::mem::take(&mut *node.edges.lock());
            std::mem::drop(node);
            for mut edge in edges {
                (edge.op)()?;
                let node = edge.node;
                if node.ready() {
                    queue.push_back(node.clone())
                }
            }
        }
        Ok(())
    }
    fn into_dyn(self) -> Node<IxDyn> {
        Node {
            inner: self.inner,
            _m: PhantomData,
        }
    }
    fn into_dimensionality<D2: Dimension>(self) -> Node<D2> {
        Node {
            inner: self.inner,
            _m: PhantomData,
        }
    }
}

/// Variable.
///
/// Variables are arrays with an optional [`Node`] that stores a gradient. Numerical operations
/// on variables with a node create a graph of edges that is traversed during the backward pass
/// to compute the gradients.
///
/// Variables can be created from arrays via [`From`].
/// Use [`builder()`](Variable::builder) to create a Variable as a function of another variable.
#[derive(Clone, Debug)]
pub struct Variable<D: Dimension> {
    value: ArcArray<f32, D>,
    node: Option<Node<D>>,
}

/// Variable with 1 element
pub type Variable0 = Variable<Ix0>;
/// Variable with 1 dimension
pub type Variable1 = Variable<Ix1>;
/// Variable with 2 dimensions
pub type Variable2 = Variable<Ix2>;
/// Variable with 4 dimensions, NHWC.
pub type Variable4 = Variable<Ix4>;
/// Variable with dynamic dimensions
pub type VariableD = Variable<IxDyn>;

impl<D: Dimension + 'static> Variable<D> {
    /// A `VariableBuilder` for creating nodes and edges.
    pub fn builder() -> VariableBuilder<D> {
        VariableBuilder::new()
    }
    /// The value of the variable.
    pub fn value(&self) -> &ArcArray<f32, D> {
        &self.value
    }
    /// Converts the variable into its value.
    pub fn into_value(self) -> ArcArray<f32, D> {
        self.value
    }
    /// The node.
    pub fn node(&self) -> Option<&Node<D>> {
        self.node.as_ref()
    }
    /// Whether a gradient will be computed for this variable.
    pub fn requires_grad(&self) -> bool {
        self.node.is_some()
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim in pattern form.
    pub fn dim(&self) -> D::Pattern {
        self.value.dim()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Variable<D2>, ShapeError>
    where
        D2: Dimension,
    {
        let value = self.value.into_dimensionality()?;
        Ok(Variable {
            value,
            node: self.node.map(Node::into_dimensionality),
        })
    }
    /// Converts into a dynamic dimensional variable.
    pub fn into_dyn(self) -> VariableD {
        Variable {
            value: self.value.into_dyn(),
            node: self.node.map(Node::into_dyn),
        }
    }
    /// Elementwise addition.
    ///
    /// **Errors**
    ///
    /// [`Error::Shape`](crate::error::Error::Shape) if the shapes differ. No broadcasting is
    /// performed.
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        if self.shape() != rhs.shape() {
            return Err(shape_error!(
                "can not add {:?} and {:?}",
                self.shape(),
                rhs.shape()
            ));
        }
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, Ok);
        }
        if let Some(node) = rhs.node() {
            builder.edge(node, Ok);
        }
        let value = (&self.value + &rhs.value).into_shared();
        Ok(builder.build(value))
    }
    /// Multiplies every element by `alpha`.
    pub fn scale(&self, alpha: f32) -> Self {
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| {
                Ok(output_grad.mapv(|dy| alpha * dy).into_shared())
            });
        }
        builder.build(self.value.mapv(|x| alpha * x).into_shared())
    }
}

impl Variable0 {
    /// The scalar value.
    pub fn item(&self) -> f32 {
        self.value[()]
    }
    /// Executes the backward pass.
    ///
    /// See [`Node::backward`].
    pub fn backward(&self) -> Result<()> {
        if let Some(node) = self.node.as_ref() {
            node.backward()?;
        }
        Ok(())
    }
}

impl<D: Dimension> From<Array<f32, D>> for Variable<D> {
    fn from(array: Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcArray<f32, D>> for Variable<D> {
    fn from(array: ArcArray<f32, D>) -> Self {
        Self {
            value: array,
            node: None,
        }
    }
}

/// Parameter.
///
/// Parameter values are updated during training by the
/// [`Optimizer`](super::optimizer::Optimizer). A Parameter can be converted to a [`Variable`]
/// via [`.to_variable()`](Parameter::to_variable), which allows it to be used in operations.
/// During training, [`.set_training(true)`](Parameter::set_training) ensures that the variable
/// created from this parameter has a [`Node`].
/// A parameter stores the [`OptimizerState`] which is updated during training.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "D: Serialize", deserialize = "D: Deserialize<'de>"))]
pub struct Parameter<D: Dimension> {
    value: ArcArray<f32, D>,
    #[serde(skip)]
    grad: Option<GradLock>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    optim_state: Option<OptimizerState>,
}

/// Parameter with 1 dimension.
pub type Parameter1 = Parameter<Ix1>;
/// Parameter with 4 dimensions.
pub type Parameter4 = Parameter<Ix4>;
/// Parameter with dynamic dimensions.
pub type ParameterD = Parameter<IxDyn>;

impl<D: Dimension> Parameter<D> {
    /// The value of the parameter.
    pub fn value(&self) -> &ArcArray<f32, D> {
        &self.value
    }
    /// Borrows the value mutably.
    ///
    /// Copies the value if it is shared with a variable.
    pub fn value_view_mut(&mut self) -> ArrayViewMut<f32, D> {
        self.value.view_mut()
    }
    /// The gradient of the parameter.
    pub fn grad(&self) -> Option<ArcArray<f32, D>> {
        self.grad
            .as_ref()?
            .read()
            .clone()?
            .into_dimensionality()
            .ok()
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        self.value.len()
    }
    /// Whether the parameter is empty.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
    /// Enables / disables training.
    ///
    /// If `training`, ensures that when the parameter is converted to a [`Variable`],
    /// it will have a [`Node`] for computing a gradient.
    /// Any gradient that has been computed is discarded.
    pub fn set_training(&mut self, training: bool) {
        if training {
            self.grad.replace(Arc::new(RwLock::default()));
        } else {
            self.grad = None;
        }
    }
    /// Whether the parameter is training.
    pub fn is_training(&self) -> bool {
        self.grad.is_some()
    }
    /// Borrows the optimizer state.
    pub fn optimizer_state(&self) -> Option<&OptimizerState> {
        self.optim_state.as_ref()
    }
    /// Borrows the value and optimizer state mutably.
    pub fn value_view_optimizer_state_mut(
        &mut self,
    ) -> (ArrayViewMut<f32, D>, Option<&mut OptimizerState>) {
        (self.value.view_mut(), self.optim_state.as_mut())
    }
    /// Initializes the optimizer state.
    ///
    /// The `name` should be the name of the optimizer, for example "Adam".
    pub fn init_optimizer_state(
        &mut self,
        name: impl Into<String>,
        key_values: impl IntoIterator<Item = (String, OptimizerValue)>,
    ) {
        self.optim_state.replace(OptimizerState::new(
            name.into(),
            key_values.into_iter().collect(),
        ));
    }
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Parameter<D2>, ShapeError>
    where
        D2: Dimension,
    {
        Ok(Parameter {
            value: self.value.into_dimensionality()?,
            grad: self.grad,
            optim_state: self.optim_state,
        })
    }
    /// Converts into a dynamic dimensional parameter.
    pub fn into_dyn(self) -> ParameterD {
        Parameter {
            value: self.value.into_dyn(),
            grad: self.grad,
            optim_state: self.optim_state,
        }
    }
    /// Converts to a `Variable`.
    pub fn to_variable(&self) -> Variable<D> {
        let value = self.value.clone();
        let node = self
            .grad
            .as_ref()
            .map(|grad| Node::new(value.raw_dim().into_dyn(), grad.clone(), Vec::new()));
        Variable { value, node }
    }
    /// Replaces the value, keeping the dimensionality.
    ///
    /// **Errors**
    ///
    /// [`Error::Shape`](crate::error::Error::Shape) if `value` has a different shape.
    /// The optimizer state is discarded.
    pub fn assign(&mut self, value: ArcArray<f32, D>) -> Result<()> {
        if value.shape() != self.shape() {
            return Err(shape_error!(
                "can not assign {:?} to a parameter of shape {:?}",
                value.shape(),
                self.shape()
            ));
        }
        self.value = value;
        self.optim_state = None;
        Ok(())
    }
}

impl<D: Dimension> From<Array<f32, D>> for Parameter<D> {
    fn from(array: Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcArray<f32, D>> for Parameter<D> {
    fn from(array: ArcArray<f32, D>) -> Self {
        Self {
            value: array,
            grad: None,
            optim_state: None,
        }
    }
}

impl<D: Dimension> Debug for Parameter<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("shape", &self.shape())
            .field("training", &self.is_training())
            .field("optim_state", &self.optim_state)
            .finish()
    }
}
